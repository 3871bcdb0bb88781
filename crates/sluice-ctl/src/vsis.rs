//! VSI-S control grammar: `name?args` queries and `name=arg1:arg2` commands,
//! semicolon separated, answered as `!name? <code> : values ;`.

use std::fmt;

/// Reply status codes fixed by the command set.
pub mod code {
    pub const OK: u32 = 0;
    /// Used as query where only command is valid, or the other way around.
    pub const WRONG_DIRECTION: u32 = 2;
    pub const IO: u32 = 4;
    pub const INTERNAL: u32 = 5;
    pub const BUSY: u32 = 6;
    pub const SYNTAX: u32 = 8;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub name: String,
    pub query: bool,
    pub args: Vec<String>,
}

impl Request {
    /// Argument `n` (0-based), if present and non-empty.
    pub fn arg(&self, n: usize) -> Option<&str> {
        self.args.get(n).map(String::as_str).filter(|s| !s.is_empty())
    }
}

/// Split one control line into requests. Malformed items come back as
/// `Err(raw_text)` so the server can reply with a syntax error naming them.
pub fn parse_line(line: &str) -> Vec<Result<Request, String>> {
    line.split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_request)
        .collect()
}

fn parse_request(part: &str) -> Result<Request, String> {
    let sep = part
        .find(['?', '='])
        .ok_or_else(|| part.to_string())?;
    let name = part[..sep].trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(part.to_string());
    }
    let query = part.as_bytes()[sep] == b'?';
    let rest = &part[sep + 1..];
    let args = if rest.trim().is_empty() {
        Vec::new()
    } else {
        rest.split(':').map(|a| a.trim().to_string()).collect()
    };
    Ok(Request { name: name.to_string(), query, args })
}

/// One reply, rendered in VSI-S form by its `Display`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub name: String,
    pub query: bool,
    pub code: u32,
    pub values: Vec<String>,
}

impl Reply {
    pub fn ok(req: &Request) -> Self {
        Self::with_code(req, code::OK)
    }

    pub fn with_code(req: &Request, code: u32) -> Self {
        Self { name: req.name.clone(), query: req.query, code, values: Vec::new() }
    }

    pub fn ok_with(req: &Request, values: Vec<String>) -> Self {
        Self { name: req.name.clone(), query: req.query, code: code::OK, values }
    }

    pub fn error(req: &Request, code: u32, message: impl Into<String>) -> Self {
        Self {
            name: req.name.clone(),
            query: req.query,
            code,
            values: vec![message.into()],
        }
    }

    /// Only valid as a query.
    pub fn query_only(req: &Request) -> Self {
        Self::error(req, code::WRONG_DIRECTION, "only available as query")
    }

    /// Only valid as a command.
    pub fn command_only(req: &Request) -> Self {
        Self::error(req, code::WRONG_DIRECTION, "only available as command")
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{}{} {}", self.name, if self.query { '?' } else { '=' }, self.code)?;
        for v in &self.values {
            write!(f, " : {v}")?;
        }
        write!(f, " ;")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splits_commands_and_queries() {
        let reqs = parse_line("mtu=9000; net_port? ;disk2net=connect : host : rec");
        assert_eq!(reqs.len(), 3);
        assert_eq!(
            reqs[0],
            Ok(Request {
                name: "mtu".into(),
                query: false,
                args: vec!["9000".into()]
            })
        );
        assert_eq!(
            reqs[1],
            Ok(Request { name: "net_port".into(), query: true, args: vec![] })
        );
        assert_eq!(
            reqs[2],
            Ok(Request {
                name: "disk2net".into(),
                query: false,
                args: vec!["connect".into(), "host".into(), "rec".into()]
            })
        );
    }

    #[test]
    fn keeps_empty_middle_arguments() {
        let reqs = parse_line("fill2net=on::0xdead");
        let req = reqs[0].as_ref().unwrap();
        assert_eq!(req.args, vec!["on", "", "0xdead"]);
        assert_eq!(req.arg(1), None);
        assert_eq!(req.arg(2), Some("0xdead"));
    }

    #[test]
    fn rejects_separator_less_text() {
        let reqs = parse_line("garbage");
        assert_eq!(reqs[0], Err("garbage".to_string()));
    }

    #[test]
    fn replies_render_vsi_s() {
        let req = Request { name: "mtu".into(), query: true, args: vec![] };
        assert_eq!(Reply::ok_with(&req, vec!["1500".into()]).to_string(), "!mtu? 0 : 1500 ;");

        let req = Request { name: "fill2net".into(), query: false, args: vec![] };
        assert_eq!(
            Reply::error(&req, code::BUSY, "transfer disk2net in progress").to_string(),
            "!fill2net= 6 : transfer disk2net in progress ;"
        );
        assert_eq!(Reply::ok(&req).to_string(), "!fill2net= 0 ;");
    }
}
