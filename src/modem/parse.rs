// ABOUTME: Parsers for modem responses: message listings, storage lists, CNMI ranges, timestamps
// ABOUTME: Pure functions over response text so they can be tested without a device

use crate::error::{SmsError, SmsResult};
use crate::gateway::ConnectionId;
use crate::message::{InboundKind, InboundMessage, MessageClass, Payload};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use regex::Regex;
use tracing::warn;

/// Stored message as listed in PDU mode: index plus raw hex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedPdu {
    pub index: u32,
    pub class: MessageClass,
    pub hex: String,
}

/// `+CMGL` status field to message class
fn class_of(status: &str) -> MessageClass {
    match status.trim().trim_matches('"') {
        "REC UNREAD" | "0" => MessageClass::Unread,
        _ => MessageClass::Read,
    }
}

fn is_header(line: &str) -> bool {
    line.starts_with("+CMGL") || line.starts_with("+CMGR")
}

/// Memory index between `:` and the first `,` of a listing header
pub(crate) fn header_index(line: &str) -> Option<u32> {
    let colon = line.find(':')?;
    let comma = line.find(',')?;
    line.get(colon + 1..comma)?.trim().parse().ok()
}

/// Parse a `yy/MM/dd` date and `HH:mm:ss[±zz]` time from a modem
///
/// The zone is given in quarter hours. Without a zone the time is taken
/// as UTC.
pub fn parse_timestamp(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let date = date.trim().trim_matches('"');
    let time = time.trim().trim_matches('"');

    let year: i32 = date.get(0..2)?.parse().ok()?;
    let month: u32 = date.get(3..5)?.parse().ok()?;
    let day: u32 = date.get(6..8)?.parse().ok()?;
    let clock = time.get(0..8)?.replace(' ', "");
    let naive = NaiveDate::from_ymd_opt(2000 + year, month, day)?
        .and_time(NaiveTime::parse_from_str(&clock, "%H:%M:%S").ok()?);

    let quarters: i32 = match time.get(8..) {
        Some(zone) if !zone.is_empty() => zone.parse().ok()?,
        _ => 0,
    };
    let offset = FixedOffset::east_opt(quarters * 15 * 60)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|at| at.with_timezone(&Utc))
}

/// Parse a text-mode `+CMGL`/`+CMGR` listing
///
/// SMS headers look like `+CMGL: 2,"REC READ","+3069...",,"08/07/02,15:10:49+08"`
/// followed by body lines up to the next header. When the third field is
/// numeric the entry is a status report:
/// `+CMGL: 3,"REC READ",6,<ref>,,"yy/MM/dd,hh:mm:ss±zz","yy/MM/dd,hh:mm:ss±zz",<st>`.
pub fn parse_text_listing(
    response: &str,
    gateway: &ConnectionId,
    location: &str,
) -> Vec<InboundMessage> {
    let normalized = Regex::new(r"\s+OK\s+")
        .map(|ok| ok.replace_all(response, "\nOK").into_owned())
        .unwrap_or_else(|_| response.to_string());
    let mut lines = normalized.lines().map(|l| l.trim_end_matches('\r')).peekable();
    let mut messages = Vec::new();

    while let Some(line) = lines.next() {
        let line = line.trim();
        if line.eq_ignore_ascii_case("OK") {
            break;
        }
        if !is_header(line) {
            continue;
        }
        let Some(index) = header_index(line) else {
            warn!(gateway = %gateway, "unparsable listing header: {}", line);
            continue;
        };

        let padded = line.replace(",,", ", ,");
        let fields: Vec<&str> = padded.split(',').collect();
        let field = |i: usize| fields.get(i).map(|f| f.trim()).unwrap_or("");
        let class = class_of(field(1));

        let status_report = field(2).chars().next().is_some_and(|c| c.is_ascii_digit());
        let mut message = if status_report {
            let mut report = InboundMessage::new(
                gateway.clone(),
                field(4).trim_matches('"'),
                Payload::Text(field(9).trim_matches('"').to_string()),
            );
            report.kind = InboundKind::StatusReport;
            report.provider_id = Some(field(3).to_string());
            if let Some(at) = parse_timestamp(field(7), field(8)) {
                report.received_at = at;
            }
            report
        } else {
            let mut body = Vec::new();
            while let Some(next) = lines.peek() {
                let next = next.trim_end();
                if is_header(next) || next.eq_ignore_ascii_case("OK") {
                    break;
                }
                body.push(next.to_string());
                lines.next();
            }
            let mut sms = InboundMessage::new(
                gateway.clone(),
                field(2).trim_matches('"'),
                Payload::Text(body.join("\n").trim().to_string()),
            );
            if let Some(at) = parse_timestamp(field(4), field(5)) {
                sms.received_at = at;
            }
            sms
        };
        message.class = class;
        message.memory_index = Some(index);
        message.memory_location = Some(location.to_string());
        messages.push(message);
    }
    messages
}

/// Parse a PDU-mode listing: `+CMGL: idx,stat,,len` followed by the hex line
///
/// Modems that omit the SMSC field report `len*2 == hex.len()`; those
/// PDUs get the empty SMSC octet `00` prefixed so every PDU has one.
pub fn parse_pdu_listing(response: &str) -> Vec<ListedPdu> {
    let mut listed = Vec::new();
    let mut lines = response.lines().map(str::trim).filter(|l| !l.is_empty());

    while let Some(line) = lines.next() {
        if line == "OK" || line.contains("ERROR") {
            break;
        }
        if !line.starts_with("+CMGL") {
            continue;
        }
        let Some(index) = header_index(line) else {
            continue;
        };
        let fields: Vec<&str> = line.split(',').collect();
        let class = class_of(fields.get(1).copied().unwrap_or(""));
        let length: Option<usize> = fields.last().and_then(|l| l.trim().parse().ok());
        let Some(hex) = lines.next() else {
            break;
        };
        let hex = match length {
            Some(len) if len * 2 == hex.len() => format!("00{hex}"),
            _ => hex.to_string(),
        };
        listed.push(ListedPdu { index, class, hex });
    }
    listed
}

/// Storage codes from an `AT+CPMS=?` response, concatenated (`"SMME"`)
///
/// Only the first (read/delete) group counts; `MT` is skipped because it
/// aliases the others. Falls back to `SM` when nothing can be parsed.
pub fn parse_storage_locations(response: &str) -> String {
    let detected = response.find("+CPMS:").and_then(|start| {
        let rest = &response[start..];
        let open = rest.find('(')?;
        let group = rest[open..].trim_start_matches('(');
        let close = group.find(')')?;
        Some(
            group[..close]
                .split(',')
                .map(|loc| loc.trim().trim_matches('"'))
                .filter(|loc| loc.len() == 2 && !loc.eq_ignore_ascii_case("MT"))
                .fold(String::new(), |mut all, loc| {
                    if !all.as_bytes().chunks(2).any(|c| c == loc.as_bytes()) {
                        all.push_str(loc);
                    }
                    all
                }),
        )
    });
    match detected {
        Some(locations) if !locations.is_empty() => locations,
        _ => "SM".to_string(),
    }
}

/// Message reference from `+CMGS: <ref>`
pub fn parse_cmgs_reference(response: &str) -> Option<u32> {
    let start = response.find("+CMGS:")? + "+CMGS:".len();
    let digits: String = response[start..]
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Registration state (second field) of an `AT+CREG?` answer
///
/// `+CREG: 1,5` → 5. Unsolicited-mode answers carry the state first, so
/// a single field is taken as the state.
pub fn parse_creg(response: &str) -> Option<u32> {
    let start = response.find("+CREG:")? + "+CREG:".len();
    let line = response[start..].lines().next()?;
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let state = if fields.len() >= 2 { fields[1] } else { fields[0] };
    state.parse().ok()
}

/// Rewrite a CDMA `+CMGR` header into the canonical listing layout
///
/// `+CMGR:"REC UNREAD","139...","08/07/09,11 :41 :49",0,2,3,23` becomes
/// `+CMGR: <index>,"REC UNREAD","139...",,"08/07/09,11:41:49",0,2,3,23`
/// and the generic text parser handles it. Also returns the encoding digit.
pub fn rewrite_cdma_header(header: &str, index: u32) -> SmsResult<(String, Option<char>)> {
    let pattern = Regex::new(
        r#"(^\+CMGR:)("[^"]+",)("[^"]+",)("[^,]+,)(\d+)\s+(:\d+)\s+(:\d+")(,\d,)(\d)"#,
    )
    .map_err(|e| SmsError::Config(format!("bad pattern: {e}")))?;

    let encoding = pattern
        .captures(header)
        .and_then(|c| c.get(9))
        .and_then(|m| m.as_str().chars().next());
    let rewritten = pattern
        .replace_all(header, format!("$1 {index},$2$3,$4$5$6$7$8$9").as_str())
        .into_owned();
    Ok((rewritten, encoding))
}

/// Pick `AT+CNMI` parameters from an `AT+CNMI=?` response
///
/// Preferred values per position: mode 3 then 2, mt 1, bm 0, ds 2, bfr 0;
/// when none is offered the last supported value is used. Returns `None`
/// when the response lists fewer than five parameter groups.
pub fn detect_cnmi(response: &str) -> Option<String> {
    const PREFERRED: [&[u32]; 5] = [&[3, 2], &[1], &[0], &[2], &[0]];

    let start = response.find("+CNMI:").map(|i| i + "+CNMI:".len()).unwrap_or(0);
    let splitter = Regex::new(r"\(\d+(?:[-,]\d+)*\)|\d+").ok()?;
    let groups: Vec<Vec<u32>> = splitter
        .find_iter(&response[start..])
        .map(|m| expand_range(m.as_str()))
        .collect();
    if groups.len() < 5 {
        return None;
    }

    let chosen: Vec<String> = PREFERRED
        .iter()
        .zip(&groups)
        .map(|(preferred, offered)| {
            preferred
                .iter()
                .find(|p| offered.contains(p))
                .or_else(|| offered.last())
                .map(u32::to_string)
                .unwrap_or_else(|| "0".to_string())
        })
        .collect();
    Some(format!("AT+CNMI={}", chosen.join(",")))
}

/// `(0-3)` → 0,1,2,3; `(0,2)` → 0,2; `1` → 1
fn expand_range(group: &str) -> Vec<u32> {
    group
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .flat_map(|part| -> Vec<u32> {
            match part.split_once('-') {
                Some((low, high)) => match (low.parse::<u32>(), high.parse::<u32>()) {
                    (Ok(low), Ok(high)) => (low..=high).collect(),
                    _ => Vec::new(),
                },
                None => part.parse().ok().into_iter().collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn gw() -> ConnectionId {
        ConnectionId::new("modem1")
    }

    #[test]
    fn timestamp_with_quarter_hour_zone() {
        let at = parse_timestamp("\"08/07/02", "15:10:49+08\"").unwrap();
        // +08 quarters is UTC+2
        assert_eq!(at.to_rfc3339(), "2008-07-02T13:10:49+00:00");

        let west = parse_timestamp("08/07/02", "15:10:49-04").unwrap();
        assert_eq!(west.hour(), 16);
    }

    #[test]
    fn timestamp_without_zone_is_utc() {
        let at = parse_timestamp("\"08/07/09", "11:41:49\"").unwrap();
        assert_eq!(at.to_rfc3339(), "2008-07-09T11:41:49+00:00");
        assert!(parse_timestamp("garbage", "x").is_none());
    }

    #[test]
    fn text_listing_with_multiline_bodies() {
        let response = "\r\n+CMGL: 1,\"REC UNREAD\",\"+306970000001\",,\"08/07/02,15:10:49+08\"\r\n\
                        Hello\r\nWorld\r\n\
                        +CMGL: 4,\"REC READ\",\"+306970000002\",,\"08/07/03,09:00:00+00\"\r\n\
                        Second\r\n\r\nOK\r\n";
        let messages = parse_text_listing(response, &gw(), "SM");
        assert_eq!(messages.len(), 2);

        assert_eq!(messages[0].originator, "+306970000001");
        assert_eq!(messages[0].text(), "Hello\nWorld");
        assert_eq!(messages[0].class, MessageClass::Unread);
        assert_eq!(messages[0].memory_index, Some(1));
        assert_eq!(messages[0].memory_location.as_deref(), Some("SM"));
        assert_eq!(messages[0].received_at.to_rfc3339(), "2008-07-02T13:10:49+00:00");

        assert_eq!(messages[1].text(), "Second");
        assert_eq!(messages[1].class, MessageClass::Read);
        assert_eq!(messages[1].memory_index, Some(4));
    }

    #[test]
    fn text_listing_status_report() {
        let response = "+CMGL: 3,\"REC READ\",6,121,,\"08/07/02,15:10:49+08\",\"08/07/02,15:11:02+08\",0\r\n\r\nOK\r\n";
        let messages = parse_text_listing(response, &gw(), "SR");
        assert_eq!(messages.len(), 1);
        let report = &messages[0];
        assert_eq!(report.kind, InboundKind::StatusReport);
        assert_eq!(report.provider_id.as_deref(), Some("121"));
        assert_eq!(report.text(), "0");
        assert_eq!(report.received_at.to_rfc3339(), "2008-07-02T13:11:02+00:00");
    }

    #[test]
    fn empty_listing() {
        assert!(parse_text_listing("\r\nOK\r\n", &gw(), "SM").is_empty());
    }

    #[test]
    fn pdu_listing_adds_missing_smsc() {
        let response = "+CMGL: 1,0,,4\r\n0A0B0C0D\r\n+CMGL: 2,1,,3\r\n07911326\r\n\r\nOK\r\n";
        let listed = parse_pdu_listing(response);
        assert_eq!(
            listed,
            vec![
                ListedPdu {
                    index: 1,
                    class: MessageClass::Unread,
                    hex: "000A0B0C0D".into()
                },
                ListedPdu {
                    index: 2,
                    class: MessageClass::Read,
                    hex: "07911326".into()
                },
            ]
        );
    }

    #[test]
    fn storage_locations_skip_mt_and_duplicates() {
        let response = "+CPMS: (\"SM\",\"ME\",\"MT\",\"SM\"),(\"SM\",\"ME\"),(\"SM\")\r\n\r\nOK";
        assert_eq!(parse_storage_locations(response), "SMME");
        assert_eq!(parse_storage_locations("ERROR"), "SM");
    }

    #[test]
    fn cmgs_reference() {
        assert_eq!(parse_cmgs_reference("\r\n+CMGS: 42\r\n\r\nOK\r\n"), Some(42));
        assert_eq!(parse_cmgs_reference("\r\nOK\r\n"), None);
    }

    #[test]
    fn creg_state() {
        assert_eq!(parse_creg("\r\n+CREG: 1,5\r\n\r\nOK\r\n"), Some(5));
        assert_eq!(parse_creg("+CREG: 2\r\n"), Some(2));
        assert_eq!(parse_creg("ERROR"), None);
    }

    #[test]
    fn cdma_header_is_rewritten() {
        let (header, encoding) = rewrite_cdma_header(
            "+CMGR:\"REC UNREAD\",\"13911577644\",\"08/07/09,11 :41 :49\",0,2,3,23",
            6,
        )
        .unwrap();
        assert_eq!(
            header,
            "+CMGR: 6,\"REC UNREAD\",\"13911577644\",,\"08/07/09,11:41:49\",0,2,3,23"
        );
        assert_eq!(encoding, Some('2'));

        let text = format!("{header}\r\nJust for test\r\nOK\r\n");
        let messages = parse_text_listing(&text, &gw(), "MT");
        assert_eq!(messages[0].originator, "13911577644");
        assert_eq!(messages[0].memory_index, Some(6));
        assert_eq!(messages[0].text(), "Just for test");
    }

    #[test]
    fn cnmi_prefers_known_good_values() {
        let response = "+CNMI: (0-3),(0-3),(0,2),(0-2),(0,1)\r\n\r\nOK";
        assert_eq!(detect_cnmi(response).as_deref(), Some("AT+CNMI=3,1,0,2,0"));

        let limited = "+CNMI: (0,1,2),(0,1),(0),(0,1),(1)\r\nOK";
        assert_eq!(detect_cnmi(limited).as_deref(), Some("AT+CNMI=2,1,0,1,1"));

        assert!(detect_cnmi("+CNMI: (0-3),(0-3)").is_none());
    }
}
