use std::collections::BTreeMap;

use quick_xml::{
    de::from_str,
    events::{BytesStart, Event},
    Reader,
};
use tracing::{debug, warn};

use crate::{
    error::{ParseError, TextPosition},
    models::{
        Address, AddressFamily, HostResult, HostStatus, Hostname, OsGuess, ParsedResult,
        PortResult, PortState, ScanStats, ServiceInfo,
    },
};

const ROOT_ELEMENT: &[u8] = b"nmaprun";

#[derive(Debug, serde::Deserialize)]
struct NmapHost {
    #[serde(default)]
    status: Option<NmapStatus>,
    #[serde(rename = "address", default)]
    addresses: Vec<NmapAddress>,
    #[serde(default)]
    hostnames: Option<NmapHostnames>,
    #[serde(default)]
    os: Option<NmapOs>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapStatus {
    #[serde(rename = "@state", default)]
    state: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapAddress {
    #[serde(rename = "@addr", default)]
    addr: Option<String>,
    #[serde(rename = "@addrtype", default)]
    addrtype: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapHostnames {
    #[serde(rename = "hostname", default)]
    hostnames: Vec<NmapHostname>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapHostname {
    #[serde(rename = "@name", default)]
    name: Option<String>,
    #[serde(rename = "@type", default)]
    kind: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapPort {
    #[serde(rename = "@portid", default)]
    portid: Option<String>,
    #[serde(rename = "@protocol", default)]
    protocol: Option<String>,
    #[serde(default)]
    state: Option<NmapState>,
    #[serde(default)]
    service: Option<NmapService>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapState {
    #[serde(rename = "@state", default)]
    state: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapService {
    #[serde(rename = "@name", default)]
    name: Option<String>,
    #[serde(rename = "@product", default)]
    product: Option<String>,
    #[serde(rename = "@version", default)]
    version: Option<String>,
    #[serde(rename = "@extrainfo", default)]
    extrainfo: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapOs {
    #[serde(rename = "osmatch", default)]
    matches: Vec<NmapOsMatch>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapOsMatch {
    #[serde(rename = "@name", default)]
    name: Option<String>,
    #[serde(rename = "@accuracy", default)]
    accuracy: Option<String>,
}

/// Top-level view of the document: the first `<scaninfo>` and the raw text
/// of each `<host>` element directly under the root.
struct Outline<'a> {
    scan_info: BTreeMap<String, String>,
    hosts: Vec<&'a str>,
}

/// Parses nmap XML (`-oX`) into a [`ParsedResult`]. Broken host or port
/// entries are dropped; only an unreadable document is an error.
pub fn parse_nmap_xml(raw: &[u8]) -> Result<ParsedResult, ParseError> {
    let xml = std::str::from_utf8(raw).map_err(|e| {
        let text = String::from_utf8_lossy(&raw[..e.valid_up_to()]);
        malformed(&text, e.valid_up_to(), format!("invalid UTF-8: {e}"))
    })?;

    let outline = outline(xml)?;
    let mut result = ParsedResult {
        scan_info: outline.scan_info,
        hosts: Vec::with_capacity(outline.hosts.len()),
        stats: ScanStats::default(),
    };

    for (index, fragment) in outline.hosts.into_iter().enumerate() {
        let (rest, port_fragments) = match split_ports(fragment) {
            Ok(split) => split,
            Err(e) => {
                warn!(host_index = index, error = %e, "skipping malformed host entry");
                continue;
            }
        };
        let host = match from_str::<NmapHost>(&rest) {
            Ok(host) => host,
            Err(e) => {
                warn!(host_index = index, error = %e, "skipping malformed host entry");
                continue;
            }
        };
        let ports = port_fragments
            .into_iter()
            .filter_map(|fragment| match from_str::<NmapPort>(fragment) {
                Ok(port) => Some(port),
                Err(e) => {
                    debug!(host_index = index, error = %e, "skipping malformed port entry");
                    None
                }
            })
            .collect();
        let Some(host) = normalize_host(index, host, ports) else {
            continue;
        };

        if host.status == HostStatus::Up {
            result.stats.hosts_up += 1;
        } else {
            result.stats.hosts_down += 1;
        }
        result.stats.total_ports += host.ports.len() as u32;
        result.hosts.push(host);
    }
    result.stats.total_hosts = result.hosts.len() as u32;

    Ok(result)
}

fn malformed(text: &str, offset: usize, message: String) -> ParseError {
    ParseError::MalformedOutput {
        message,
        position: TextPosition::locate(text, offset),
    }
}

fn outline(xml: &str) -> Result<Outline<'_>, ParseError> {
    let mut reader = Reader::from_str(xml);
    let mut outline = Outline {
        scan_info: BTreeMap::new(),
        hosts: vec![],
    };
    let mut depth = 0usize;
    let mut root_seen = false;
    let mut scan_info_seen = false;
    let mut host_start: Option<usize> = None;

    loop {
        let event = reader.read_event();
        let pos = reader.buffer_position() as usize;
        // attribute values cannot hold a raw '<', so the last one opens this tag
        let tag_start = || xml[..pos].rfind('<').unwrap_or(0);

        match event {
            Err(e) => return Err(malformed(xml, pos, e.to_string())),
            Ok(Event::Start(tag)) => {
                if depth == 0 {
                    check_root(xml, &tag, root_seen, pos)?;
                    root_seen = true;
                } else if depth == 1 && tag.name().as_ref() == b"host" {
                    host_start = Some(tag_start());
                } else if depth == 1 && tag.name().as_ref() == b"scaninfo" && !scan_info_seen {
                    scan_info_seen = true;
                    outline.scan_info = attributes(xml, &tag, pos)?;
                }
                depth += 1;
            }
            Ok(Event::End(_)) => {
                depth = depth.saturating_sub(1);
                if depth == 1 {
                    if let Some(start) = host_start.take() {
                        outline.hosts.push(&xml[start..pos]);
                    }
                }
            }
            Ok(Event::Empty(tag)) => {
                if depth == 0 {
                    check_root(xml, &tag, root_seen, pos)?;
                    root_seen = true;
                } else if depth == 1 && tag.name().as_ref() == b"host" {
                    outline.hosts.push(&xml[tag_start()..pos]);
                } else if depth == 1 && tag.name().as_ref() == b"scaninfo" && !scan_info_seen {
                    scan_info_seen = true;
                    outline.scan_info = attributes(xml, &tag, pos)?;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
        }
    }

    if depth != 0 {
        return Err(malformed(
            xml,
            xml.len(),
            format!("unexpected end of document with {depth} element(s) still open"),
        ));
    }
    if !root_seen {
        return Err(malformed(xml, xml.len(), "document has no root element".to_string()));
    }
    Ok(outline)
}

/// Cuts every `<port>` under `<ports>` out of a host fragment, so a broken
/// port costs only itself. Returns the host text without those ports.
fn split_ports(host: &str) -> Result<(String, Vec<&str>), quick_xml::Error> {
    let mut reader = Reader::from_str(host);
    let mut ports = vec![];
    let mut depth = 0usize;
    let mut in_ports = false;
    let mut port_start: Option<usize> = None;

    loop {
        let event = reader.read_event()?;
        let pos = reader.buffer_position() as usize;
        let tag_start = || host[..pos].rfind('<').unwrap_or(0);

        match event {
            Event::Start(tag) => {
                if depth == 1 && tag.name().as_ref() == b"ports" {
                    in_ports = true;
                } else if depth == 2 && in_ports && tag.name().as_ref() == b"port" {
                    port_start = Some(tag_start());
                }
                depth += 1;
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth == 2 {
                    if let Some(start) = port_start.take() {
                        ports.push((start, pos));
                    }
                } else if depth == 1 {
                    in_ports = false;
                }
            }
            Event::Empty(tag) => {
                if depth == 2 && in_ports && tag.name().as_ref() == b"port" {
                    ports.push((tag_start(), pos));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let mut rest = String::with_capacity(host.len());
    let mut cursor = 0;
    for &(start, end) in &ports {
        rest.push_str(&host[cursor..start]);
        cursor = end;
    }
    rest.push_str(&host[cursor..]);
    Ok((rest, ports.iter().map(|&(start, end)| &host[start..end]).collect()))
}

fn check_root(xml: &str, tag: &BytesStart<'_>, root_seen: bool, pos: usize) -> Result<(), ParseError> {
    if root_seen {
        return Err(malformed(xml, pos, "more than one root element".to_string()));
    }
    if tag.name().as_ref() != ROOT_ELEMENT {
        return Err(malformed(
            xml,
            pos,
            format!(
                "unexpected root element <{}>",
                String::from_utf8_lossy(tag.name().as_ref())
            ),
        ));
    }
    Ok(())
}

fn attributes(xml: &str, tag: &BytesStart<'_>, pos: usize) -> Result<BTreeMap<String, String>, ParseError> {
    let mut map = BTreeMap::new();
    for attr in tag.attributes() {
        let attr = attr.map_err(|e| malformed(xml, pos, e.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|e| malformed(xml, pos, e.to_string()))?;
        map.insert(
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            value.into_owned(),
        );
    }
    Ok(map)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn normalize_host(index: usize, host: NmapHost, ports: Vec<NmapPort>) -> Option<HostResult> {
    let addresses: Vec<Address> = host
        .addresses
        .into_iter()
        .filter_map(|a| {
            let value = non_empty(a.addr)?;
            let family = match a.addrtype.as_deref() {
                Some("ipv4") => AddressFamily::Ipv4,
                Some("ipv6") => AddressFamily::Ipv6,
                Some("mac") => AddressFamily::Mac,
                _ => AddressFamily::Unknown,
            };
            Some(Address { value, family })
        })
        .collect();
    if addresses.is_empty() {
        warn!(host_index = index, "skipping host entry without an address");
        return None;
    }

    let status = match host.status.and_then(|s| s.state).as_deref() {
        Some("up") => HostStatus::Up,
        Some("down") => HostStatus::Down,
        _ => HostStatus::Unknown,
    };

    let hostnames = host
        .hostnames
        .map(|h| h.hostnames)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|h| {
            Some(Hostname {
                name: non_empty(h.name)?,
                source: h.kind,
            })
        })
        .collect();

    let ports = ports
        .into_iter()
        .filter_map(|p| normalize_port(index, p))
        .collect();

    let os_guess = host.os.and_then(|os| {
        os.matches.into_iter().find_map(|m| {
            let name = non_empty(m.name)?;
            let accuracy: u8 = m.accuracy?.trim().parse().ok()?;
            Some(OsGuess {
                name,
                confidence_percent: accuracy.min(100),
            })
        })
    });

    Some(HostResult {
        status,
        addresses,
        hostnames,
        ports,
        os_guess,
    })
}

fn normalize_port(host_index: usize, port: NmapPort) -> Option<PortResult> {
    let number = match port.portid.as_deref().map(str::trim).map(str::parse::<u16>) {
        Some(Ok(n)) if n > 0 => n,
        _ => {
            debug!(host_index, portid = ?port.portid, "skipping port with invalid number");
            return None;
        }
    };
    let Some(protocol) = non_empty(port.protocol) else {
        debug!(host_index, number, "skipping port without protocol");
        return None;
    };

    let state = port
        .state
        .and_then(|s| s.state)
        .map(|s| PortState::from_tool(&s))
        .unwrap_or(PortState::Unknown);

    let service = port.service.map(|s| ServiceInfo {
        name: non_empty(s.name),
        product: non_empty(s.product),
        version: non_empty(s.version),
        extra_info: non_empty(s.extrainfo),
    });

    Some(PortResult {
        protocol,
        number,
        state,
        service,
    })
}
