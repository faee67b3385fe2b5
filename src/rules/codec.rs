//! Text format for rule files.
//!
//! One rule per line, whitespace separated:
//!
//! ```text
//! # comment
//! evil.example.com   127.0.0.1   ::1
//! ads.example.net    0.0.0.0     -
//! v6only.test        fe80::1
//! ```
//!
//! A two-field line picks `a` or `aaaa` from the address family. With three
//! fields the columns are positional and `-` marks an absent address.

use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write as _};
use std::net::IpAddr;
use std::path::Path;
use std::str::{self, FromStr};

use tracing::warn;

use super::MasqHost;
use crate::error::RuleError;

const ABSENT: &str = "-";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// A rejected line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// 1-based line number.
    pub line: usize,
    pub error: RuleError,
}

/// Result of decoding a rule file.
#[derive(Debug, Default)]
pub struct Decoded {
    pub hosts: Vec<MasqHost>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Decode rules from text.
///
/// Bad lines are skipped and reported; the rest still load.
pub fn decode(text: &str) -> Decoded {
    decode_bytes(text.as_bytes())
}

/// Decode rules from raw file contents.
///
/// A leading byte order mark is ignored. Lines that are not valid UTF-8 are
/// reported like any other bad line.
pub fn decode_bytes(data: &[u8]) -> Decoded {
    let data = data.strip_prefix(UTF8_BOM).unwrap_or(data);
    let mut decoded = Decoded::default();

    for (idx, raw) in data.split(|&b| b == b'\n').enumerate() {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let result = match str::from_utf8(raw) {
            Ok(text) => {
                let line = strip_comment(text).trim();
                if line.is_empty() {
                    continue;
                }
                decode_line(line)
            }
            Err(_) => Err(RuleError::MalformedLine(
                String::from_utf8_lossy(raw).into_owned(),
            )),
        };

        match result {
            Ok(host) => decoded.hosts.push(host),
            Err(error) => {
                warn!(line = idx + 1, %error, "skipping rule line");
                decoded.diagnostics.push(Diagnostic {
                    line: idx + 1,
                    error,
                });
            }
        }
    }

    decoded
}

fn strip_comment(line: &str) -> &str {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') || trimmed.starts_with(';') {
        return "";
    }
    let mut prev_ws = false;
    for (i, c) in line.char_indices() {
        if prev_ws && (c == '#' || c == ';') {
            return &line[..i];
        }
        prev_ws = c.is_whitespace();
    }
    line
}

/// Parse a single rule in rule-file syntax.
pub fn parse_rule(line: &str) -> Result<MasqHost, RuleError> {
    decode_line(strip_comment(line).trim())
}

fn decode_line(line: &str) -> Result<MasqHost, RuleError> {
    let fields: Vec<&str> = line.split_whitespace().collect();

    let (name, a, aaaa) = match fields.as_slice() {
        [name, addr] => match parse_field::<IpAddr>(addr)? {
            Some(IpAddr::V4(v4)) => (*name, Some(v4), None),
            Some(IpAddr::V6(v6)) => (*name, None, Some(v6)),
            None => return Err(RuleError::MalformedLine(line.to_string())),
        },
        [name, a, aaaa] => (*name, parse_field(a)?, parse_field(aaaa)?),
        _ => return Err(RuleError::MalformedLine(line.to_string())),
    };

    MasqHost::new(name, a, aaaa)
        .map_err(|e| RuleError::MalformedLine(format!("{}: {}", line, e)))
}

/// Parse an address column; `-` means absent.
fn parse_field<T: FromStr>(field: &str) -> Result<Option<T>, RuleError> {
    if field == ABSENT {
        return Ok(None);
    }
    field
        .parse()
        .map(Some)
        .map_err(|_| RuleError::InvalidAddress(field.to_string()))
}

/// Encode rules, one line each, in the given order.
pub fn encode(hosts: &[MasqHost]) -> String {
    let width = hosts.iter().map(|h| h.name().len()).max().unwrap_or(0);
    let mut out = String::from("# umleitung masquerade rules\n# name a aaaa\n");

    for host in hosts {
        let a = host.a().map(|a| a.to_string());
        let aaaa = host.aaaa().map(|a| a.to_string());
        let _ = writeln!(
            out,
            "{:<width$}  {:<15}  {}",
            host.name(),
            a.as_deref().unwrap_or(ABSENT),
            aaaa.as_deref().unwrap_or(ABSENT),
            width = width,
        );
    }

    out
}

/// Read and decode a rule file.
pub fn read_file(path: &Path) -> io::Result<Decoded> {
    let data = fs::read(path)?;
    Ok(decode_bytes(&data))
}

/// Encode rules and write them to `path`.
///
/// The file is written next to the target and renamed into place.
pub fn write_file(path: &Path, hosts: &[MasqHost]) -> io::Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(encode(hosts).as_bytes())?;
        file.sync_all()?;
    }

    fs::rename(&tmp, path)
}
