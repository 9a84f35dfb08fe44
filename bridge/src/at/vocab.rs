//! AT vocabulary: field splitting and the value maps shared by the
//! response and URC handlers.
//!
//! All numeric conversions are checked; a field that does not parse
//! yields "absent" rather than a guess.

/// Split a comma-separated AT payload, honoring double quotes.
pub fn split_fields(data: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let bytes = data.as_bytes();
    let mut start = 0;
    let mut quoted = false;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => quoted = !quoted,
            b',' if !quoted => {
                fields.push(data[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    fields.push(data[start..].trim());
    fields
}

/// Strip one pair of surrounding double quotes, if present.
pub fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(s)
}

/// `<CREG stat>` to the published registration state.
pub fn reg_status(stat: u32) -> Option<&'static str> {
    match stat {
        0 => Some("none"),
        1 => Some("registered"),
        2 => Some("searching"),
        3 => Some("denied"),
        4 => Some("unknown"),
        5 => Some("roaming"),
        6 => Some("sms-only"),
        7 => Some("roaming-sms-only"),
        8 => Some("emergency"),
        _ => None,
    }
}

/// Access-technology field to the published `nt` value. SIMCOM modems
/// report 8 for CDMA where everyone else means GPRS.
pub fn technology(nt: u32, simcom: bool) -> Option<&'static str> {
    match nt {
        0 => Some("gprs"),
        1 => Some("gprs-c"),
        2 | 4..=6 => Some("3g"),
        3 => Some("edge"),
        7 | 9 | 10 => Some("4g"),
        8 => Some(if simcom { "cdma" } else { "gprs" }),
        11 | 13 | 14 => Some("5g"),
        12 => Some("eps"),
        _ => None,
    }
}

/// Bit-error-rate index to its percentage bucket.
pub fn ber_bucket(ber: u32) -> Option<&'static str> {
    match ber {
        0 => Some("<0.01%"),
        1 => Some("0.01% -- 0.1%"),
        2 => Some("0.1% -- 0.5%"),
        3 => Some("0.5% -- 1%"),
        4 => Some("1% -- 2%"),
        5 => Some("2% -- 4%"),
        6 => Some("4% -- 8%"),
        _ => None,
    }
}

/// Raw CSQ RSSI to dBm; 99 means not detectable.
pub fn rssi_dbm(rssi: u32) -> Option<i32> {
    if rssi == 99 {
        None
    } else {
        Some(-113 + 2 * rssi as i32)
    }
}

/// Parse `+CSQ: <rssi>,<ber>` payload (text after the colon).
pub fn parse_csq(data: &str) -> Option<(u32, u32)> {
    let fields = split_fields(data);
    let rssi = fields.first()?.parse().ok()?;
    let ber = fields.get(1)?.parse().ok()?;
    Some((rssi, ber))
}

/// Decode a quoted hex field (`"ABCD"`) to its decimal string form.
pub fn hex_field_to_decimal(field: &str) -> Option<String> {
    let raw = unquote(field);
    if raw.is_empty() {
        return None;
    }
    u64::from_str_radix(raw, 16).ok().map(|v| v.to_string())
}

/// Parsed `+CREG` / `+CGREG` payload.
#[derive(Debug, PartialEq, Eq)]
pub struct Registration {
    pub stat: u32,
    pub lac: Option<String>,
    pub cellid: Option<String>,
    pub nt: Option<u32>,
}

/// Parse a registration payload. `solicited` drops the leading `<n>`
/// mode field that the `AT+C(G)REG?` response carries. An unsolicited
/// report normally starts straight at `<stat>`, but a bare numeric
/// second field can only be the solicited shape (the URC's second
/// field is the quoted `<lac>`), so the mode is dropped there too.
/// A payload whose status field does not parse is no update at all.
pub fn parse_registration(data: &str, solicited: bool) -> Option<Registration> {
    let mut fields = split_fields(data);
    let shifted = !solicited
        && fields.len() >= 2
        && !fields[1].starts_with('"')
        && fields[1].parse::<u32>().is_ok();
    if solicited || shifted {
        if fields.len() < 2 {
            return None;
        }
        fields.remove(0);
    }
    let stat = fields.first()?.parse().ok()?;
    Some(Registration {
        stat,
        lac: fields.get(1).and_then(|f| hex_field_to_decimal(f)),
        cellid: fields.get(2).and_then(|f| hex_field_to_decimal(f)),
        nt: fields.get(3).and_then(|f| f.parse().ok()),
    })
}

/// Parsed `+COPS?` payload: the operator field and trailing technology.
#[derive(Debug, PartialEq, Eq)]
pub struct CurrentOperator {
    pub oper: Option<String>,
    pub nt: Option<u32>,
}

/// Parse `+COPS: <mode>[,<format>,<oper>[,<tech>]]`.
pub fn parse_cops_current(data: &str) -> CurrentOperator {
    let fields = split_fields(data);
    let oper = fields.get(2).map(|f| unquote(f)).filter(|s| !s.is_empty());
    CurrentOperator {
        oper: oper.map(String::from),
        nt: fields.get(3).and_then(|f| f.parse().ok()),
    }
}

/// One entry of a `+COPS=?` scan listing.
#[derive(Debug, PartialEq, Eq)]
pub struct ScannedOperator {
    pub stat: u32,
    pub name: String,
    pub numeric: String,
}

/// Parse the `+COPS=?` listing payload:
/// `(2,"Long","Short","310260",7),(…),,(0,1,2,3,4),(0,1,2)`.
/// Parsing stops at the double comma before the support lists.
pub fn parse_cops_listing(data: &str) -> Vec<ScannedOperator> {
    let mut ops = Vec::new();
    let mut rest = data.trim();
    while let Some(inner) = rest.strip_prefix('(') {
        let Some(end) = inner.find(')') else { break };
        let fields = split_fields(&inner[..end]);
        if let Some(stat) = fields.first().and_then(|f| f.parse().ok()) {
            ops.push(ScannedOperator {
                stat,
                name: fields.get(1).map(|f| unquote(f)).unwrap_or("").to_string(),
                numeric: fields.get(3).map(|f| unquote(f)).unwrap_or("").to_string(),
            });
        }
        rest = inner[end + 1..].trim_start_matches(',').trim_start();
        // a second leading comma (the ,, divider) leaves rest starting
        // with '(' only for the support lists — their first field is a
        // bare digit too, so rely on the divider instead:
        if inner[end + 1..].starts_with(",,") {
            break;
        }
    }
    ops
}

/// Serialize a scan listing the way the `ops` topic carries it:
/// `<status-char><mcc-mnc>:<name>` entries, comma separated. Status
/// characters: `?` unknown, ` ` available, `*` current, `-` forbidden.
pub fn ops_value(ops: &[ScannedOperator]) -> String {
    let mut out = String::new();
    for op in ops {
        if !out.is_empty() {
            out.push(',');
        }
        let status = match op.stat {
            0 => '?',
            1 => ' ',
            2 => '*',
            3 => '-',
            _ => '?',
        };
        out.push(status);
        out.push_str(&op.numeric);
        out.push(':');
        out.push_str(&op.name);
    }
    out
}

/// Parse one `+COPN: "<id>","<name>"` line (payload after the colon).
pub fn parse_copn(data: &str) -> Option<(String, String)> {
    let fields = split_fields(data);
    let id = unquote(fields.first()?);
    let name = unquote(fields.get(1)?);
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((id.to_string(), name.to_string()))
}

/// Parse `+CNUM: <alpha>,<number>,<type>` — the subscriber number.
pub fn parse_cnum(data: &str) -> Option<String> {
    let fields = split_fields(data);
    let number = unquote(fields.get(1)?);
    if number.is_empty() {
        None
    } else {
        Some(number.to_string())
    }
}

/// Parse `+CSPN: "<name>",<display>` — the SIM-declared operator name.
pub fn parse_cspn(data: &str) -> Option<String> {
    let fields = split_fields(data);
    let name = unquote(fields.first()?);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Expected first-token prefix for the response to `cmd`, e.g.
/// `AT+CSQ` → `+CSQ`, `AT*CNTI=0` → `*CNTI`. Commands without a
/// `+`/`*` body (plain `AT`, `ATE0`) have no information response.
pub fn expected_prefix(cmd: &str) -> Option<String> {
    let rest = cmd
        .trim()
        .strip_prefix("AT")
        .or_else(|| cmd.trim().strip_prefix("at"))?;
    if !rest.starts_with('+') && !rest.starts_with('*') {
        return None;
    }
    let end = rest.find(['=', '?']).unwrap_or(rest.len());
    Some(rest[..end].to_ascii_uppercase())
}

/// True when `line` closes a response group.
pub fn is_terminator(line: &str) -> bool {
    line == "OK"
        || line == "ERROR"
        || line == "ABORT"
        || line == "NO CARRIER"
        || line.starts_with("+CME ERROR")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_fields_quoted() {
        assert_eq!(
            split_fields("1,5,\"AB,CD\",7"),
            vec!["1", "5", "\"AB,CD\"", "7"]
        );
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"T-Mobile\""), "T-Mobile");
        assert_eq!(unquote("310260"), "310260");
        assert_eq!(unquote("\"unterminated"), "\"unterminated");
    }

    #[test]
    fn test_parse_csq() {
        assert_eq!(parse_csq("12,3"), Some((12, 3)));
        assert_eq!(parse_csq("99, 99"), Some((99, 99)));
        assert_eq!(parse_csq("nonsense"), None);
    }

    #[test]
    fn test_rssi_conversion() {
        assert_eq!(rssi_dbm(12), Some(-89));
        assert_eq!(rssi_dbm(0), Some(-113));
        assert_eq!(rssi_dbm(99), None);
    }

    #[test]
    fn test_ber_buckets() {
        assert_eq!(ber_bucket(3), Some("0.5% -- 1%"));
        assert_eq!(ber_bucket(0), Some("<0.01%"));
        assert_eq!(ber_bucket(7), None);
        assert_eq!(ber_bucket(99), None);
    }

    #[test]
    fn test_reg_status_map() {
        assert_eq!(reg_status(1), Some("registered"));
        assert_eq!(reg_status(5), Some("roaming"));
        assert_eq!(reg_status(8), Some("emergency"));
        assert_eq!(reg_status(9), None);
    }

    #[test]
    fn test_technology_map() {
        assert_eq!(technology(7, false), Some("4g"));
        assert_eq!(technology(8, false), Some("gprs"));
        assert_eq!(technology(8, true), Some("cdma"));
        assert_eq!(technology(12, false), Some("eps"));
        assert_eq!(technology(14, false), Some("5g"));
        assert_eq!(technology(99, false), None);
    }

    #[test]
    fn test_hex_field_to_decimal() {
        assert_eq!(hex_field_to_decimal("\"ABCD\"").as_deref(), Some("43981"));
        assert_eq!(hex_field_to_decimal("\"1234\"").as_deref(), Some("4660"));
        assert_eq!(hex_field_to_decimal("\"\""), None);
        assert_eq!(hex_field_to_decimal("\"XYZ\""), None);
    }

    #[test]
    fn test_parse_registration_solicited() {
        let reg = parse_registration("1,5,\"ABCD\",\"1234\",7", true).unwrap();
        assert_eq!(reg.stat, 5);
        assert_eq!(reg.lac.as_deref(), Some("43981"));
        assert_eq!(reg.cellid.as_deref(), Some("4660"));
        assert_eq!(reg.nt, Some(7));
    }

    #[test]
    fn test_parse_registration_urc() {
        let reg = parse_registration("5,\"EFGH\",\"5678\",7", false).unwrap();
        assert_eq!(reg.stat, 5);
        assert_eq!(reg.lac.as_deref(), Some("61255"));
        assert_eq!(reg.cellid.as_deref(), Some("22136"));
    }

    #[test]
    fn test_parse_registration_urc_with_mode_field() {
        // five fields can only be the solicited shape
        let reg = parse_registration("1,5,\"ABCD\",\"1234\",7", false).unwrap();
        assert_eq!(reg.stat, 5);
        assert_eq!(reg.lac.as_deref(), Some("43981"));
    }

    #[test]
    fn test_parse_registration_bad_stat_is_no_update() {
        assert_eq!(parse_registration("x,5", true), None);
        assert_eq!(parse_registration("-1", false), None);
    }

    #[test]
    fn test_parse_cops_current() {
        let cur = parse_cops_current("0,2,\"310260\",7");
        assert_eq!(cur.oper.as_deref(), Some("310260"));
        assert_eq!(cur.nt, Some(7));
        let bare = parse_cops_current("0");
        assert_eq!(bare.oper, None);
        assert_eq!(bare.nt, None);
    }

    #[test]
    fn test_parse_cops_listing() {
        let ops = parse_cops_listing(
            "(2,\"T-Mobile\",\"TMO\",\"310260\",7),(1,\"AT&T\",\"ATT\",\"310410\",7),(3,\"Verizon\",\"VZW\",\"311480\",7),,(0,1,2,3,4),(0,1,2)",
        );
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].stat, 2);
        assert_eq!(ops[0].numeric, "310260");
        assert_eq!(ops[2].name, "Verizon");
    }

    #[test]
    fn test_ops_value_serialization() {
        let ops = vec![
            ScannedOperator {
                stat: 2,
                name: "T-Mobile".into(),
                numeric: "310260".into(),
            },
            ScannedOperator {
                stat: 1,
                name: "AT&T".into(),
                numeric: "310410".into(),
            },
            ScannedOperator {
                stat: 3,
                name: "Verizon".into(),
                numeric: "311480".into(),
            },
            ScannedOperator {
                stat: 9,
                name: "Odd".into(),
                numeric: "00101".into(),
            },
        ];
        assert_eq!(
            ops_value(&ops),
            "*310260:T-Mobile, 310410:AT&T,-311480:Verizon,?00101:Odd"
        );
    }

    #[test]
    fn test_parse_copn() {
        assert_eq!(
            parse_copn("\"310260\",\"T-Mobile\""),
            Some(("310260".to_string(), "T-Mobile".to_string()))
        );
        assert_eq!(parse_copn("\"not-digits\",\"X\""), None);
    }

    #[test]
    fn test_parse_cnum() {
        assert_eq!(
            parse_cnum("\"Line 1\",\"+15551234567\",145").as_deref(),
            Some("+15551234567")
        );
        assert_eq!(parse_cnum(""), None);
    }

    #[test]
    fn test_parse_cspn() {
        assert_eq!(parse_cspn("\"Swisscom\",1").as_deref(), Some("Swisscom"));
    }

    #[test]
    fn test_expected_prefix() {
        assert_eq!(expected_prefix("AT+CSQ").as_deref(), Some("+CSQ"));
        assert_eq!(expected_prefix("AT+CREG?").as_deref(), Some("+CREG"));
        assert_eq!(expected_prefix("AT+COPS=?").as_deref(), Some("+COPS"));
        assert_eq!(expected_prefix("at*cnti=0").as_deref(), Some("*CNTI"));
        assert_eq!(expected_prefix("ATE0"), None);
        assert_eq!(expected_prefix("AT"), None);
    }

    #[test]
    fn test_is_terminator() {
        assert!(is_terminator("OK"));
        assert!(is_terminator("ERROR"));
        assert!(is_terminator("NO CARRIER"));
        assert!(is_terminator("ABORT"));
        assert!(is_terminator("+CME ERROR: 10"));
        assert!(!is_terminator("+CSQ: 12,3"));
    }
}
