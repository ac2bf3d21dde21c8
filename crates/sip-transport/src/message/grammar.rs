//! RFC 3261 grammar fragments shared by the Via, URI and message parsers
//!
//! ABNF (RFC 3261 25.1, simplified to what the transport layer reads):
//!
//! ```text
//! token          = 1*(alphanum / "-" / "." / "!" / "%" / "*" / "_" / "+" / "`" / "'" / "~")
//! hostport       = host [ ":" port ]
//! host           = hostname / IPv4address / IPv6reference
//! generic-param  = token [ EQUAL gen-value ]
//! gen-value      = token / host / quoted-string
//! ```

use nom::{
    branch::alt,
    bytes::complete::{take_till, take_while1},
    character::complete::{char, digit1, space0},
    combinator::{map, map_res, opt, recognize},
    multi::many0,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

pub(crate) type ParseResult<'a, O> = IResult<&'a str, O>;

/// Ordered `name[=value]` parameters
pub(crate) type Params = Vec<(String, Option<String>)>;

pub(crate) fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)
}

pub(crate) fn token(input: &str) -> ParseResult<&str> {
    take_while1(is_token_char)(input)
}

pub(crate) fn port(input: &str) -> ParseResult<u16> {
    map_res(digit1, |digits: &str| digits.parse::<u16>())(input)
}

fn ipv6_reference(input: &str) -> ParseResult<&str> {
    recognize(delimited(
        char('['),
        take_while1(|c: char| c.is_ascii_hexdigit() || c == ':' || c == '.'),
        char(']'),
    ))(input)
}

fn hostname(input: &str) -> ParseResult<&str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')(input)
}

pub(crate) fn host(input: &str) -> ParseResult<&str> {
    alt((ipv6_reference, hostname))(input)
}

pub(crate) fn host_port(input: &str) -> ParseResult<(&str, Option<u16>)> {
    pair(host, opt(preceded(char(':'), port)))(input)
}

fn quoted_string(input: &str) -> ParseResult<&str> {
    recognize(delimited(char('"'), take_till(|c: char| c == '"'), char('"')))(input)
}

fn param_value(input: &str) -> ParseResult<&str> {
    alt((
        quoted_string,
        take_while1(|c: char| is_token_char(c) || c == '[' || c == ']' || c == ':'),
    ))(input)
}

fn equal(input: &str) -> ParseResult<char> {
    delimited(space0, char('='), space0)(input)
}

fn semi(input: &str) -> ParseResult<char> {
    delimited(space0, char(';'), space0)(input)
}

pub(crate) fn generic_param(input: &str) -> ParseResult<(String, Option<String>)> {
    map(pair(token, opt(preceded(equal, param_value))), |(name, value)| {
        (name.to_string(), value.map(str::to_string))
    })(input)
}

/// Zero or more `;name[=value]` parameters
pub(crate) fn params(input: &str) -> ParseResult<Params> {
    many0(preceded(semi, generic_param))(input)
}

/// `SIP/2.0`, split into protocol name and version
pub(crate) fn sip_version(input: &str) -> ParseResult<(&str, &str)> {
    map(tuple((token, char('/'), token)), |(name, _, version)| (name, version))(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nom::combinator::all_consuming;

    #[test]
    fn test_host_port() {
        assert_eq!(host_port("example.com:5060"), Ok(("", ("example.com", Some(5060)))));
        assert_eq!(host_port("[2001:db8::1]:5062"), Ok(("", ("[2001:db8::1]", Some(5062)))));
        assert_eq!(host_port("10.0.0.1;rport"), Ok((";rport", ("10.0.0.1", None))));
    }

    #[test]
    fn test_port_out_of_range_is_not_consumed() {
        assert_eq!(host_port("host:70000"), Ok((":70000", ("host", None))));
        assert!(all_consuming(host_port)("host:70000").is_err());
    }

    #[test]
    fn test_params() {
        let (rest, parsed) = params(";branch=z9hG4bK1 ; rport;received=[::1];x=\"a b\"").unwrap();
        assert!(rest.is_empty());
        assert_eq!(
            parsed,
            vec![
                ("branch".to_string(), Some("z9hG4bK1".to_string())),
                ("rport".to_string(), None),
                ("received".to_string(), Some("[::1]".to_string())),
                ("x".to_string(), Some("\"a b\"".to_string())),
            ]
        );
    }

    #[test]
    fn test_token_rejects_separators() {
        assert!(token("<sip").is_err());
        assert_eq!(token("INVITE sip:x"), Ok((" sip:x", "INVITE")));
    }
}
