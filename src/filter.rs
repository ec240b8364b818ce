//! Search filters in BER form (RFC 4511 section 4.5.1.7) and string form (RFC 4515).

use std::fmt;
use std::str::FromStr;

use crate::ber::{BerReader, BerWriter};
use crate::error::{DecodeError, LdapError};

const FILTER_AND: u8 = 0xA0;
const FILTER_OR: u8 = 0xA1;
const FILTER_NOT: u8 = 0xA2;
const FILTER_EQUALITY: u8 = 0xA3;
const FILTER_SUBSTRINGS: u8 = 0xA4;
const FILTER_GREATER_OR_EQUAL: u8 = 0xA5;
const FILTER_LESS_OR_EQUAL: u8 = 0xA6;
const FILTER_PRESENT: u8 = 0x87;
const FILTER_APPROX_MATCH: u8 = 0xA8;
const FILTER_EXTENSIBLE_MATCH: u8 = 0xA9;

const SUBSTRING_INITIAL: u8 = 0x80;
const SUBSTRING_ANY: u8 = 0x81;
const SUBSTRING_FINAL: u8 = 0x82;

const EXTENSIBLE_MATCHING_RULE: u8 = 0x81;
const EXTENSIBLE_TYPE: u8 = 0x82;
const EXTENSIBLE_MATCH_VALUE: u8 = 0x83;
const EXTENSIBLE_DN_ATTRIBUTES: u8 = 0x84;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality {
        attribute: String,
        value: Vec<u8>,
    },
    Substrings {
        attribute: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        final_value: Option<Vec<u8>>,
    },
    GreaterOrEqual {
        attribute: String,
        value: Vec<u8>,
    },
    LessOrEqual {
        attribute: String,
        value: Vec<u8>,
    },
    Present(String),
    ApproxMatch {
        attribute: String,
        value: Vec<u8>,
    },
    Extensible {
        matching_rule: Option<String>,
        attribute: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

impl Filter {
    /// Parse an RFC 4515 filter string. The outer parentheses may be omitted.
    pub fn parse(s: &str) -> Result<Filter, LdapError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(LdapError::Filter("empty filter".to_string()));
        }
        let wrapped;
        let text = if trimmed.starts_with('(') {
            trimmed
        } else {
            wrapped = format!("({})", trimmed);
            wrapped.as_str()
        };
        let mut parser = FilterParser {
            input: text.as_bytes(),
            pos: 0,
        };
        let filter = parser.parse_filter()?;
        if parser.pos != parser.input.len() {
            return Err(parser.error("unexpected characters after the filter"));
        }
        Ok(filter)
    }

    pub fn equality(attribute: impl Into<String>, value: impl Into<Vec<u8>>) -> Filter {
        Filter::Equality {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn present(attribute: impl Into<String>) -> Filter {
        Filter::Present(attribute.into())
    }

    /// `(objectClass=*)`, matching every entry.
    pub fn match_all() -> Filter {
        Filter::present("objectClass")
    }

    pub(crate) fn encode(&self, writer: &mut BerWriter) -> Result<(), LdapError> {
        match self {
            Filter::And(filters) | Filter::Or(filters) => {
                let tag = if matches!(self, Filter::And(_)) { FILTER_AND } else { FILTER_OR };
                writer.write_start_sequence_with_tag(tag);
                for filter in filters {
                    filter.encode(writer)?;
                }
                writer.write_end_sequence()?;
            }
            Filter::Not(inner) => {
                writer.write_start_sequence_with_tag(FILTER_NOT);
                inner.encode(writer)?;
                writer.write_end_sequence()?;
            }
            Filter::Equality { attribute, value } => {
                encode_assertion(writer, FILTER_EQUALITY, attribute, value)?
            }
            Filter::GreaterOrEqual { attribute, value } => {
                encode_assertion(writer, FILTER_GREATER_OR_EQUAL, attribute, value)?
            }
            Filter::LessOrEqual { attribute, value } => {
                encode_assertion(writer, FILTER_LESS_OR_EQUAL, attribute, value)?
            }
            Filter::ApproxMatch { attribute, value } => {
                encode_assertion(writer, FILTER_APPROX_MATCH, attribute, value)?
            }
            Filter::Substrings {
                attribute,
                initial,
                any,
                final_value,
            } => {
                writer.write_start_sequence_with_tag(FILTER_SUBSTRINGS);
                writer.write_string(attribute);
                writer.write_start_sequence();
                if let Some(initial) = initial {
                    writer.write_octet_string_with_tag(SUBSTRING_INITIAL, initial);
                }
                for part in any {
                    writer.write_octet_string_with_tag(SUBSTRING_ANY, part);
                }
                if let Some(final_value) = final_value {
                    writer.write_octet_string_with_tag(SUBSTRING_FINAL, final_value);
                }
                writer.write_end_sequence()?;
                writer.write_end_sequence()?;
            }
            Filter::Present(attribute) => {
                writer.write_octet_string_with_tag(FILTER_PRESENT, attribute.as_bytes());
            }
            Filter::Extensible {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            } => {
                writer.write_start_sequence_with_tag(FILTER_EXTENSIBLE_MATCH);
                if let Some(rule) = matching_rule {
                    writer.write_octet_string_with_tag(EXTENSIBLE_MATCHING_RULE, rule.as_bytes());
                }
                if let Some(attribute) = attribute {
                    writer.write_octet_string_with_tag(EXTENSIBLE_TYPE, attribute.as_bytes());
                }
                writer.write_octet_string_with_tag(EXTENSIBLE_MATCH_VALUE, value);
                if *dn_attributes {
                    writer.write_boolean_with_tag(EXTENSIBLE_DN_ATTRIBUTES, true);
                }
                writer.write_end_sequence()?;
            }
        }
        Ok(())
    }

    pub(crate) fn decode(reader: &mut BerReader) -> Result<Filter, DecodeError> {
        let tag = reader.peek_type()?;
        match tag {
            FILTER_AND | FILTER_OR => {
                reader.read_start_sequence()?;
                let mut filters = Vec::new();
                while reader.has_next_element() {
                    filters.push(Filter::decode(reader)?);
                }
                reader.read_end_sequence()?;
                Ok(if tag == FILTER_AND {
                    Filter::And(filters)
                } else {
                    Filter::Or(filters)
                })
            }
            FILTER_NOT => {
                reader.read_start_sequence()?;
                let inner = Filter::decode(reader)?;
                reader.read_end_sequence()?;
                Ok(Filter::Not(Box::new(inner)))
            }
            FILTER_EQUALITY | FILTER_GREATER_OR_EQUAL | FILTER_LESS_OR_EQUAL | FILTER_APPROX_MATCH => {
                reader.read_start_sequence()?;
                let attribute = reader.read_octet_string_utf8()?;
                let value = reader.read_octet_string()?;
                reader.read_end_sequence()?;
                Ok(match tag {
                    FILTER_EQUALITY => Filter::Equality { attribute, value },
                    FILTER_GREATER_OR_EQUAL => Filter::GreaterOrEqual { attribute, value },
                    FILTER_LESS_OR_EQUAL => Filter::LessOrEqual { attribute, value },
                    _ => Filter::ApproxMatch { attribute, value },
                })
            }
            FILTER_SUBSTRINGS => {
                reader.read_start_sequence()?;
                let attribute = reader.read_octet_string_utf8()?;
                let mut initial = None;
                let mut any = Vec::new();
                let mut final_value = None;
                reader.read_start_sequence()?;
                while reader.has_next_element() {
                    let part_tag = reader.peek_type()?;
                    let part = reader.read_octet_string()?;
                    match part_tag {
                        SUBSTRING_INITIAL => initial = Some(part),
                        SUBSTRING_ANY => any.push(part),
                        SUBSTRING_FINAL => final_value = Some(part),
                        other => {
                            return Err(DecodeError::UnexpectedTag {
                                expected: SUBSTRING_ANY,
                                actual: other,
                            })
                        }
                    }
                }
                reader.read_end_sequence()?;
                reader.read_end_sequence()?;
                Ok(Filter::Substrings {
                    attribute,
                    initial,
                    any,
                    final_value,
                })
            }
            FILTER_PRESENT => Ok(Filter::Present(reader.read_octet_string_utf8()?)),
            FILTER_EXTENSIBLE_MATCH => {
                reader.read_start_sequence()?;
                let mut matching_rule = None;
                let mut attribute = None;
                let mut value = None;
                let mut dn_attributes = false;
                while reader.has_next_element() {
                    match reader.peek_type()? {
                        EXTENSIBLE_MATCHING_RULE => matching_rule = Some(reader.read_octet_string_utf8()?),
                        EXTENSIBLE_TYPE => attribute = Some(reader.read_octet_string_utf8()?),
                        EXTENSIBLE_MATCH_VALUE => value = Some(reader.read_octet_string()?),
                        EXTENSIBLE_DN_ATTRIBUTES => dn_attributes = reader.read_boolean()?,
                        _ => reader.skip_element()?,
                    }
                }
                reader.read_end_sequence()?;
                Ok(Filter::Extensible {
                    matching_rule,
                    attribute,
                    value: value.ok_or(DecodeError::Malformed("extensible match filter"))?,
                    dn_attributes,
                })
            }
            other => Err(DecodeError::InvalidValue {
                field: "filter tag",
                value: other as i64,
            }),
        }
    }
}

fn encode_assertion(writer: &mut BerWriter, tag: u8, attribute: &str, value: &[u8]) -> Result<(), LdapError> {
    writer.write_start_sequence_with_tag(tag);
    writer.write_string(attribute);
    writer.write_octet_string(value);
    writer.write_end_sequence()
}

impl FromStr for Filter {
    type Err = LdapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Filter::parse(s)
    }
}

struct FilterParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl FilterParser<'_> {
    fn error(&self, message: &str) -> LdapError {
        LdapError::Filter(format!("{} at offset {}", message, self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, expected: u8) -> Result<(), LdapError> {
        if self.peek() != Some(expected) {
            return Err(self.error(&format!("expected '{}'", expected as char)));
        }
        self.pos += 1;
        Ok(())
    }

    fn parse_filter(&mut self) -> Result<Filter, LdapError> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(self.error("unexpected end of filter")),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn parse_list(&mut self) -> Result<Vec<Filter>, LdapError> {
        let mut filters = Vec::new();
        while self.peek() == Some(b'(') {
            filters.push(self.parse_filter()?);
        }
        Ok(filters)
    }

    fn parse_item(&mut self) -> Result<Filter, LdapError> {
        let start = self.pos;
        let end = self.input[start..]
            .iter()
            .position(|&b| b == b')')
            .map(|i| start + i)
            .ok_or_else(|| self.error("missing ')'"))?;
        let item = &self.input[start..end];
        let eq = item
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| self.error("missing '=' in filter item"))?;
        let (lhs, value) = (&item[..eq], &item[eq + 1..]);
        let filter = match lhs.split_last() {
            Some((b'~', attribute)) => Filter::ApproxMatch {
                attribute: self.attribute_name(attribute)?,
                value: self.unescape(value)?,
            },
            Some((b'>', attribute)) => Filter::GreaterOrEqual {
                attribute: self.attribute_name(attribute)?,
                value: self.unescape(value)?,
            },
            Some((b'<', attribute)) => Filter::LessOrEqual {
                attribute: self.attribute_name(attribute)?,
                value: self.unescape(value)?,
            },
            Some((b':', description)) => self.extensible(description, value)?,
            _ => {
                let attribute = self.attribute_name(lhs)?;
                if value == b"*" {
                    Filter::Present(attribute)
                } else if value.contains(&b'*') {
                    self.substrings(attribute, value)?
                } else {
                    Filter::Equality {
                        attribute,
                        value: self.unescape(value)?,
                    }
                }
            }
        };
        self.pos = end;
        Ok(filter)
    }

    fn substrings(&self, attribute: String, value: &[u8]) -> Result<Filter, LdapError> {
        let parts: Vec<&[u8]> = value.split(|&b| b == b'*').collect();
        let last = parts.len() - 1;
        let mut initial = None;
        let mut any = Vec::new();
        let mut final_value = None;
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            let part = self.unescape(part)?;
            if i == 0 {
                initial = Some(part);
            } else if i == last {
                final_value = Some(part);
            } else {
                any.push(part);
            }
        }
        // SubstringFilter requires at least one component.
        if initial.is_none() && any.is_empty() && final_value.is_none() {
            return Err(self.error("substring filter without a value"));
        }
        Ok(Filter::Substrings {
            attribute,
            initial,
            any,
            final_value,
        })
    }

    // attr[:dn][:rule] or [:dn]:rule, before ":="
    fn extensible(&self, description: &[u8], value: &[u8]) -> Result<Filter, LdapError> {
        let description = std::str::from_utf8(description)
            .map_err(|_| self.error("attribute description is not UTF-8"))?;
        let mut components = description.split(':');
        let attribute = components
            .next()
            .filter(|a| !a.is_empty())
            .map(str::to_string);
        let mut dn_attributes = false;
        let mut matching_rule = None;
        for component in components {
            if component.eq_ignore_ascii_case("dn") && matching_rule.is_none() {
                dn_attributes = true;
            } else if !component.is_empty() && matching_rule.is_none() {
                matching_rule = Some(component.to_string());
            } else {
                return Err(self.error("malformed extensible match"));
            }
        }
        if attribute.is_none() && matching_rule.is_none() {
            return Err(self.error("extensible match needs an attribute or a matching rule"));
        }
        Ok(Filter::Extensible {
            matching_rule,
            attribute,
            value: self.unescape(value)?,
            dn_attributes,
        })
    }

    fn attribute_name(&self, raw: &[u8]) -> Result<String, LdapError> {
        let name = std::str::from_utf8(raw)
            .map_err(|_| self.error("attribute description is not UTF-8"))?
            .trim();
        if name.is_empty() {
            return Err(self.error("missing attribute description"));
        }
        Ok(name.to_string())
    }

    fn unescape(&self, raw: &[u8]) -> Result<Vec<u8>, LdapError> {
        let mut out = Vec::with_capacity(raw.len());
        let mut i = 0;
        while i < raw.len() {
            if raw[i] == b'\\' {
                let hex = raw
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| self.error("invalid escape sequence"))?;
                out.push(hex);
                i += 3;
            } else {
                out.push(raw[i]);
                i += 1;
            }
        }
        Ok(out)
    }
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &[u8]) -> fmt::Result {
    match std::str::from_utf8(value) {
        Ok(text) => {
            for c in text.chars() {
                match c {
                    '*' | '(' | ')' | '\\' | '\0' => write!(f, "\\{:02x}", c as u32)?,
                    c => write!(f, "{}", c)?,
                }
            }
        }
        Err(_) => {
            for &b in value {
                if b.is_ascii_graphic() && !matches!(b, b'*' | b'(' | b')' | b'\\') || b == b' ' {
                    write!(f, "{}", b as char)?;
                } else {
                    write!(f, "\\{:02x}", b)?;
                }
            }
        }
    }
    Ok(())
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(filters) | Filter::Or(filters) => {
                write!(f, "({}", if matches!(self, Filter::And(_)) { '&' } else { '|' })?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                write!(f, ")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::Equality { attribute, value } => {
                write!(f, "({}=", attribute)?;
                write_value(f, value)?;
                write!(f, ")")
            }
            Filter::GreaterOrEqual { attribute, value } => {
                write!(f, "({}>=", attribute)?;
                write_value(f, value)?;
                write!(f, ")")
            }
            Filter::LessOrEqual { attribute, value } => {
                write!(f, "({}<=", attribute)?;
                write_value(f, value)?;
                write!(f, ")")
            }
            Filter::ApproxMatch { attribute, value } => {
                write!(f, "({}~=", attribute)?;
                write_value(f, value)?;
                write!(f, ")")
            }
            Filter::Substrings {
                attribute,
                initial,
                any,
                final_value,
            } => {
                write!(f, "({}=", attribute)?;
                if let Some(initial) = initial {
                    write_value(f, initial)?;
                }
                write!(f, "*")?;
                for part in any {
                    write_value(f, part)?;
                    write!(f, "*")?;
                }
                if let Some(final_value) = final_value {
                    write_value(f, final_value)?;
                }
                write!(f, ")")
            }
            Filter::Present(attribute) => write!(f, "({}=*)", attribute),
            Filter::Extensible {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            } => {
                write!(f, "(")?;
                if let Some(attribute) = attribute {
                    write!(f, "{}", attribute)?;
                }
                if *dn_attributes {
                    write!(f, ":dn")?;
                }
                if let Some(rule) = matching_rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":=")?;
                write_value(f, value)?;
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ber(filter: &Filter) -> Vec<u8> {
        let mut writer = BerWriter::new();
        filter.encode(&mut writer).unwrap();
        writer.into_vec().unwrap()
    }

    #[test]
    fn test_parse_simple_items() {
        assert_eq!(Filter::parse("(cn=foo)").unwrap(), Filter::equality("cn", "foo"));
        assert_eq!(Filter::parse("cn=foo").unwrap(), Filter::equality("cn", "foo"));
        assert_eq!(Filter::parse("(objectClass=*)").unwrap(), Filter::match_all());
        assert_eq!(
            Filter::parse("(uidNumber>=1000)").unwrap(),
            Filter::GreaterOrEqual {
                attribute: "uidNumber".to_string(),
                value: b"1000".to_vec()
            }
        );
        assert_eq!(
            Filter::parse("(sn~=smith)").unwrap(),
            Filter::ApproxMatch {
                attribute: "sn".to_string(),
                value: b"smith".to_vec()
            }
        );
    }

    #[test]
    fn test_parse_nested() {
        let filter = Filter::parse("(&(objectClass=person)(|(uid=jdoe)(!(mail=*))))").unwrap();
        assert_eq!(
            filter,
            Filter::And(vec![
                Filter::equality("objectClass", "person"),
                Filter::Or(vec![
                    Filter::equality("uid", "jdoe"),
                    Filter::Not(Box::new(Filter::present("mail"))),
                ]),
            ])
        );
        assert_eq!(filter.to_string(), "(&(objectClass=person)(|(uid=jdoe)(!(mail=*))))");
    }

    #[test]
    fn test_parse_substrings() {
        assert_eq!(
            Filter::parse("(cn=jo*n*d*oe)").unwrap(),
            Filter::Substrings {
                attribute: "cn".to_string(),
                initial: Some(b"jo".to_vec()),
                any: vec![b"n".to_vec(), b"d".to_vec()],
                final_value: Some(b"oe".to_vec()),
            }
        );
        let trailing = Filter::parse("(cn=*smith*)").unwrap();
        assert_eq!(
            trailing,
            Filter::Substrings {
                attribute: "cn".to_string(),
                initial: None,
                any: vec![b"smith".to_vec()],
                final_value: None,
            }
        );
        assert_eq!(trailing.to_string(), "(cn=*smith*)");
    }

    #[test]
    fn test_parse_escapes() {
        let filter = Filter::parse(r"(cn=a\2a\28b\29\5c)").unwrap();
        assert_eq!(filter, Filter::equality("cn", b"a*(b)\\".to_vec()));
        assert_eq!(filter.to_string(), r"(cn=a\2a\28b\29\5c)");

        let binary = Filter::equality("objectGUID", vec![0x01, 0xFF, b'a']);
        assert_eq!(binary.to_string(), r"(objectGUID=\01\ffa)");
        assert_eq!(Filter::parse(&binary.to_string()).unwrap(), binary);
    }

    #[test]
    fn test_parse_extensible() {
        assert_eq!(
            Filter::parse("(cn:dn:2.5.13.5:=John)").unwrap(),
            Filter::Extensible {
                matching_rule: Some("2.5.13.5".to_string()),
                attribute: Some("cn".to_string()),
                value: b"John".to_vec(),
                dn_attributes: true,
            }
        );
        let rule_only = Filter::parse("(:caseExactMatch:=Fred)").unwrap();
        assert_eq!(rule_only.to_string(), "(:caseExactMatch:=Fred)");
    }

    #[test]
    fn test_parse_errors() {
        let bad_filters = [
            "", "(cn=foo", "(&(cn=a)", "()", "(=x)", r"(cn=\zz)", "(cn=a))", "(:dn:=x)", "(cn=**)", "(cn=***)",
        ];
        for bad in bad_filters {
            assert!(Filter::parse(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_ber_encoding() {
        assert_eq!(
            ber(&Filter::equality("cn", "foo")),
            vec![0xA3, 0x09, 0x04, 0x02, b'c', b'n', 0x04, 0x03, b'f', b'o', b'o']
        );
        let present = ber(&Filter::match_all());
        assert_eq!(&present[..2], &[0x87, 0x0B]);
        assert_eq!(&present[2..], b"objectClass");
    }

    #[test]
    fn test_ber_decode_matches_parse() {
        for text in [
            "(&(objectClass=person)(|(uid=jdoe)(!(mail=*))))",
            "(cn=jo*n*d*oe)",
            "(cn:dn:2.5.13.5:=John)",
            "(uidNumber<=500)",
            "(&)",
        ] {
            let filter = Filter::parse(text).unwrap();
            let bytes = ber(&filter);
            let mut reader = BerReader::from_slice(&bytes, 0);
            assert_eq!(Filter::decode(&mut reader).unwrap(), filter, "{}", text);
            assert_eq!(reader.remaining(), 0);
        }
    }

    #[test]
    fn test_decode_unknown_filter_tag() {
        let mut reader = BerReader::from_slice(&[0xAF, 0x00], 0);
        assert!(matches!(
            Filter::decode(&mut reader),
            Err(DecodeError::InvalidValue { field: "filter tag", .. })
        ));
    }
}
