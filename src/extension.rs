//! Header grammars for extension and subprotocol negotiation.
//!
//! `Sec-WebSocket-Extensions` (RFC 6455 §9.1) is a comma-separated list of
//! extension offers, each a token followed by `;`-separated parameters whose
//! values are tokens or quoted strings. `Sec-WebSocket-Protocol` is a
//! comma-separated list of unique tokens.
//!
//! Both parsers are single-pass scanners over ASCII bytes and report the
//! byte index of the first offending character.

use crate::error::ExtensionError;

/// Value of one extension parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    /// Parameter present without a value (`; server_no_context_takeover`).
    Flag,
    /// Parameter with a token or unquoted string value.
    Value(String),
}

impl ParamValue {
    /// Textual form used in error messages.
    #[must_use]
    pub fn as_display(&self) -> &str {
        match self {
            Self::Flag => "true",
            Self::Value(value) => value,
        }
    }
}

/// Ordered parameter list of a single extension offer.
///
/// A name maps to every value it was given, in header order, so duplicate
/// parameters survive parsing and can be rejected by the negotiator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionParams {
    entries: Vec<(String, Vec<ParamValue>)>,
}

impl ExtensionParams {
    /// Empty parameter list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a value for `name`.
    pub fn push(&mut self, name: &str, value: ParamValue) {
        match self.entries.iter_mut().find(|(key, _)| key == name) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((name.to_owned(), vec![value])),
        }
    }

    /// Builder form of [`push`](Self::push) with a flag value.
    #[must_use]
    pub fn flag(mut self, name: &str) -> Self {
        self.push(name, ParamValue::Flag);
        self
    }

    /// Builder form of [`push`](Self::push) with a string value.
    #[must_use]
    pub fn value(mut self, name: &str, value: impl Into<String>) -> Self {
        self.push(name, ParamValue::Value(value.into()));
        self
    }

    /// All values given for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[ParamValue]> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, values)| values.as_slice())
    }

    /// Iterate parameters in header order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ParamValue])> {
        self.entries
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    /// Number of distinct parameter names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no parameters are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ordered mapping of extension name to the offers made for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    entries: Vec<(String, Vec<ExtensionParams>)>,
}

impl Extensions {
    /// Empty extension list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append an offer for `name`.
    pub fn push(&mut self, name: &str, params: ExtensionParams) {
        match self.entries.iter_mut().find(|(key, _)| key == name) {
            Some((_, offers)) => offers.push(params),
            None => self.entries.push((name.to_owned(), vec![params])),
        }
    }

    /// Builder form of [`push`](Self::push).
    #[must_use]
    pub fn with(mut self, name: &str, params: ExtensionParams) -> Self {
        self.push(name, params);
        self
    }

    /// Offers made for `name`, in header order.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[ExtensionParams]> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, offers)| offers.as_slice())
    }

    /// Extension names in header order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    /// Iterate extensions in header order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ExtensionParams])> {
        self.entries
            .iter()
            .map(|(key, offers)| (key.as_str(), offers.as_slice()))
    }

    /// Number of distinct extension names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the header named no extensions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// RFC 7230 `tchar`.
#[must_use]
pub const fn is_token_char(byte: u8) -> bool {
    matches!(
        byte,
        b'!' | b'#'
            | b'$'
            | b'%'
            | b'&'
            | b'\''
            | b'*'
            | b'+'
            | b'-'
            | b'.'
            | b'^'
            | b'_'
            | b'`'
            | b'|'
            | b'~'
            | b'0'..=b'9'
            | b'A'..=b'Z'
            | b'a'..=b'z'
    )
}

/// Whether `protocol` is a legal subprotocol name (a non-empty token).
#[must_use]
pub fn is_valid_protocol(protocol: &str) -> bool {
    !protocol.is_empty() && protocol.bytes().all(is_token_char)
}

const fn is_whitespace(byte: u8) -> bool {
    byte == b' ' || byte == b'\t'
}

/// Parse a `Sec-WebSocket-Extensions` header value.
#[allow(clippy::too_many_lines)] // One scanner, three phases.
pub fn parse_extensions(header: &str) -> Result<Extensions, ExtensionError> {
    let bytes = header.as_bytes();
    let mut offers = Extensions::new();
    let mut params = ExtensionParams::new();
    let mut extension_name: Option<String> = None;
    let mut param_name: Option<String> = None;
    let mut must_unescape = false;
    let mut is_escaping = false;
    let mut in_quotes = false;
    let mut start: Option<usize> = None;
    let mut end: Option<usize> = None;

    for (i, &code) in bytes.iter().enumerate() {
        let unexpected = ExtensionError::UnexpectedCharacter(i);

        if extension_name.is_none() {
            if end.is_none() && is_token_char(code) {
                start.get_or_insert(i);
            } else if i != 0 && is_whitespace(code) {
                if end.is_none() && start.is_some() {
                    end = Some(i);
                }
            } else if code == b';' || code == b',' {
                let from = start.ok_or(unexpected)?;
                let name = &header[from..end.unwrap_or(i)];
                if code == b',' {
                    offers.push(name, std::mem::take(&mut params));
                } else {
                    extension_name = Some(name.to_owned());
                }
                start = None;
                end = None;
            } else {
                return Err(unexpected);
            }
        } else if param_name.is_none() {
            if end.is_none() && is_token_char(code) {
                start.get_or_insert(i);
            } else if is_whitespace(code) {
                if end.is_none() && start.is_some() {
                    end = Some(i);
                }
            } else if code == b';' || code == b',' {
                let from = start.ok_or(unexpected)?;
                params.push(&header[from..end.unwrap_or(i)], ParamValue::Flag);
                if code == b',' {
                    if let Some(name) = extension_name.take() {
                        offers.push(&name, std::mem::take(&mut params));
                    }
                }
                start = None;
                end = None;
            } else if code == b'=' && start.is_some() && end.is_none() {
                let from = start.ok_or(unexpected)?;
                param_name = Some(header[from..i].to_owned());
                start = None;
                end = None;
            } else {
                return Err(unexpected);
            }
        } else if is_escaping {
            if !is_token_char(code) {
                return Err(unexpected);
            }
            if start.is_none() {
                start = Some(i);
            } else {
                must_unescape = true;
            }
            is_escaping = false;
        } else if in_quotes {
            if is_token_char(code) {
                start.get_or_insert(i);
            } else if code == b'"' && start.is_some() {
                in_quotes = false;
                end = Some(i);
            } else if code == b'\\' {
                is_escaping = true;
            } else {
                return Err(unexpected);
            }
        } else if code == b'"' && i > 0 && bytes[i - 1] == b'=' {
            in_quotes = true;
        } else if end.is_none() && is_token_char(code) {
            start.get_or_insert(i);
        } else if start.is_some() && is_whitespace(code) {
            if end.is_none() {
                end = Some(i);
            }
        } else if code == b';' || code == b',' {
            let from = start.ok_or(unexpected)?;
            let value = unescape(&header[from..end.unwrap_or(i)], must_unescape);
            must_unescape = false;
            if let Some(name) = param_name.take() {
                params.push(&name, ParamValue::Value(value));
            }
            if code == b',' {
                if let Some(name) = extension_name.take() {
                    offers.push(&name, std::mem::take(&mut params));
                }
            }
            start = None;
            end = None;
        } else {
            return Err(unexpected);
        }
    }

    let ends_in_whitespace = bytes.last().is_some_and(|&b| is_whitespace(b));
    let Some(from) = start else {
        return Err(ExtensionError::UnexpectedEnd);
    };
    if in_quotes || ends_in_whitespace {
        return Err(ExtensionError::UnexpectedEnd);
    }
    let token = &header[from..end.unwrap_or(bytes.len())];

    match extension_name {
        None => offers.push(token, params),
        Some(name) => {
            match param_name {
                None => params.push(token, ParamValue::Flag),
                Some(param) => {
                    params.push(&param, ParamValue::Value(unescape(token, must_unescape)));
                }
            }
            offers.push(&name, params);
        }
    }

    Ok(offers)
}

fn unescape(value: &str, must_unescape: bool) -> String {
    if must_unescape {
        value.replace('\\', "")
    } else {
        value.to_owned()
    }
}

/// Serialize extensions into a `Sec-WebSocket-Extensions` header value.
#[must_use]
pub fn format_extensions(extensions: &Extensions) -> String {
    extensions
        .iter()
        .map(|(name, offers)| {
            offers
                .iter()
                .map(|params| format_offer(name, params))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_offer(name: &str, params: &ExtensionParams) -> String {
    let mut parts = vec![name.to_owned()];
    for (key, values) in params.iter() {
        let rendered: Vec<String> = values
            .iter()
            .map(|value| match value {
                ParamValue::Flag => key.to_owned(),
                ParamValue::Value(v) => format!("{key}={v}"),
            })
            .collect();
        parts.push(rendered.join("; "));
    }
    parts.join("; ")
}

/// Parse a `Sec-WebSocket-Protocol` header into its ordered, unique tokens.
pub fn parse_protocols(header: &str) -> Result<Vec<String>, ExtensionError> {
    let mut protocols: Vec<String> = Vec::new();
    let mut start: Option<usize> = None;
    let mut end: Option<usize> = None;

    for (i, code) in header.bytes().enumerate() {
        if end.is_none() && is_token_char(code) {
            start.get_or_insert(i);
        } else if i != 0 && is_whitespace(code) {
            if end.is_none() && start.is_some() {
                end = Some(i);
            }
        } else if code == b',' {
            let from = start.ok_or(ExtensionError::UnexpectedCharacter(i))?;
            add_protocol(&mut protocols, &header[from..end.unwrap_or(i)])?;
            start = None;
            end = None;
        } else {
            return Err(ExtensionError::UnexpectedCharacter(i));
        }
    }

    match (start, end) {
        (Some(from), None) => add_protocol(&mut protocols, &header[from..])?,
        _ => return Err(ExtensionError::UnexpectedEnd),
    }
    Ok(protocols)
}

fn add_protocol(protocols: &mut Vec<String>, protocol: &str) -> Result<(), ExtensionError> {
    if protocols.iter().any(|p| p == protocol) {
        return Err(ExtensionError::DuplicateProtocol(protocol.to_owned()));
    }
    protocols.push(protocol.to_owned());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag_names(params: &ExtensionParams) -> Vec<&str> {
        params.iter().map(|(name, _)| name).collect()
    }

    #[test]
    fn parses_single_extension_without_params() {
        let parsed = parse_extensions("permessage-deflate").unwrap();
        let offers = parsed.get("permessage-deflate").unwrap();
        assert_eq!(offers.len(), 1);
        assert!(offers[0].is_empty());
    }

    #[test]
    fn parses_flags_and_values() {
        let parsed = parse_extensions(
            "permessage-deflate; client_no_context_takeover; server_max_window_bits=10",
        )
        .unwrap();
        let offer = &parsed.get("permessage-deflate").unwrap()[0];
        assert_eq!(
            offer.get("client_no_context_takeover").unwrap(),
            &[ParamValue::Flag]
        );
        assert_eq!(
            offer.get("server_max_window_bits").unwrap(),
            &[ParamValue::Value("10".into())]
        );
    }

    #[test]
    fn parses_multiple_offers_in_order() {
        let parsed =
            parse_extensions("foo, bar; baz=2;qux, foo; a=\"1\", permessage-deflate").unwrap();
        assert_eq!(
            parsed.names().collect::<Vec<_>>(),
            ["foo", "bar", "permessage-deflate"]
        );
        let foo = parsed.get("foo").unwrap();
        assert_eq!(foo.len(), 2);
        assert_eq!(foo[1].get("a").unwrap(), &[ParamValue::Value("1".into())]);
        assert_eq!(flag_names(&parsed.get("bar").unwrap()[0]), ["baz", "qux"]);
    }

    #[test]
    fn keeps_duplicate_parameter_values() {
        let parsed = parse_extensions("foo; a=1; a=2").unwrap();
        assert_eq!(
            parsed.get("foo").unwrap()[0].get("a").unwrap(),
            &[ParamValue::Value("1".into()), ParamValue::Value("2".into())]
        );
    }

    #[test]
    fn unescapes_quoted_values() {
        let parsed = parse_extensions(r#"foo; bar="ba\z""#).unwrap();
        assert_eq!(
            parsed.get("foo").unwrap()[0].get("bar").unwrap(),
            &[ParamValue::Value("baz".into())]
        );
    }

    #[test]
    fn tolerates_whitespace_around_tokens() {
        let parsed = parse_extensions("foo ;\tbar = 1").err();
        assert_eq!(parsed, Some(ExtensionError::UnexpectedCharacter(10)));

        let parsed = parse_extensions("foo ; bar=1 , baz").unwrap();
        assert_eq!(parsed.names().collect::<Vec<_>>(), ["foo", "baz"]);
    }

    #[test]
    fn rejects_malformed_headers() {
        assert_eq!(
            parse_extensions("").unwrap_err(),
            ExtensionError::UnexpectedEnd
        );
        assert_eq!(
            parse_extensions("foo;").unwrap_err(),
            ExtensionError::UnexpectedEnd
        );
        assert_eq!(
            parse_extensions("foo ").unwrap_err(),
            ExtensionError::UnexpectedEnd
        );
        assert_eq!(
            parse_extensions("foo bar").unwrap_err(),
            ExtensionError::UnexpectedCharacter(4)
        );
        assert_eq!(
            parse_extensions(",foo").unwrap_err(),
            ExtensionError::UnexpectedCharacter(0)
        );
        assert_eq!(
            parse_extensions("foo; bar=\"baz").unwrap_err(),
            ExtensionError::UnexpectedEnd
        );
        assert_eq!(
            parse_extensions("foo; bar=\"\"").unwrap_err(),
            ExtensionError::UnexpectedCharacter(10)
        );
    }

    #[test]
    fn formats_offers() {
        let extensions = Extensions::new()
            .with(
                "permessage-deflate",
                ExtensionParams::new()
                    .flag("client_max_window_bits")
                    .value("server_max_window_bits", "10"),
            )
            .with("permessage-deflate", ExtensionParams::new())
            .with("foo", ExtensionParams::new().value("a", "1").value("a", "2"));
        assert_eq!(
            format_extensions(&extensions),
            "permessage-deflate; client_max_window_bits; server_max_window_bits=10, \
             permessage-deflate, foo; a=1; a=2"
        );
    }

    #[test]
    fn format_then_parse_preserves_structure() {
        let extensions = Extensions::new().with(
            "permessage-deflate",
            ExtensionParams::new()
                .flag("server_no_context_takeover")
                .value("client_max_window_bits", "12"),
        );
        let header = format_extensions(&extensions);
        assert_eq!(parse_extensions(&header).unwrap(), extensions);
    }

    #[test]
    fn parses_protocol_list() {
        assert_eq!(parse_protocols("chat").unwrap(), ["chat"]);
        assert_eq!(
            parse_protocols("chat, superchat,\tv2.json").unwrap(),
            ["chat", "superchat", "v2.json"]
        );
    }

    #[test]
    fn rejects_bad_protocol_lists() {
        assert_eq!(
            parse_protocols("chat, chat").unwrap_err(),
            ExtensionError::DuplicateProtocol("chat".into())
        );
        assert_eq!(
            parse_protocols("chat,").unwrap_err(),
            ExtensionError::UnexpectedEnd
        );
        assert_eq!(
            parse_protocols("chat ").unwrap_err(),
            ExtensionError::UnexpectedEnd
        );
        assert_eq!(
            parse_protocols(" chat").unwrap_err(),
            ExtensionError::UnexpectedCharacter(0)
        );
        assert_eq!(
            parse_protocols("a,,b").unwrap_err(),
            ExtensionError::UnexpectedCharacter(2)
        );
    }

    #[test]
    fn validates_protocol_tokens() {
        assert!(is_valid_protocol("graphql-ws"));
        assert!(is_valid_protocol("v1.chat~x"));
        assert!(!is_valid_protocol(""));
        assert!(!is_valid_protocol("has space"));
        assert!(!is_valid_protocol("a,b"));
        assert!(!is_valid_protocol("ünicode"));
    }
}
