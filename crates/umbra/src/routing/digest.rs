//! Digest proxy authentication
//!
//! Parses a `Proxy-Authenticate: Digest ...` challenge and builds the
//! matching `Proxy-Authorization` value. MD5 and MD5-sess only, with `auth`
//! quality of protection when offered. Every connection answers a fresh
//! challenge, so the nonce count is always 1.

use std::fmt::Write as _;

const NONCE_COUNT: &str = "00000001";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    Md5,
    Md5Sess,
}

impl Algorithm {
    fn parse(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("MD5") {
            Some(Algorithm::Md5)
        } else if name.eq_ignore_ascii_case("MD5-sess") {
            Some(Algorithm::Md5Sess)
        } else {
            None
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Md5Sess => "MD5-sess",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Qop {
    Auth,
    /// Integrity over an empty body, which is all a GET or CONNECT carries
    AuthInt,
}

impl Qop {
    fn name(&self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }
}

/// A parsed Digest challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    qop: Option<Qop>,
    algorithm: Algorithm,
}

impl DigestChallenge {
    /// Parse one challenge header value. `None` for other schemes, missing
    /// realm or nonce, and unsupported algorithms.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim_start();
        let (scheme, rest) = header.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return None;
        }

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop = None;
        let mut algorithm = Algorithm::Md5;

        for (key, value) in parse_params(rest) {
            match key.as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "algorithm" => algorithm = Algorithm::parse(&value)?,
                "qop" => {
                    let offered: Vec<&str> = value.split(',').map(str::trim).collect();
                    qop = if offered.contains(&"auth") {
                        Some(Qop::Auth)
                    } else if offered.contains(&"auth-int") {
                        Some(Qop::AuthInt)
                    } else {
                        None
                    };
                }
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            nonce: nonce?,
            opaque,
            qop,
            algorithm,
        })
    }

    /// First Digest challenge among several header values
    pub fn find<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        values.into_iter().find_map(Self::parse)
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// The `Proxy-Authorization` value for one request
    pub fn authorization(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        cnonce: &str,
    ) -> String {
        let response = self.response(username, password, method, uri, cnonce);

        let mut out = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            quote(username),
            quote(&self.realm),
            quote(&self.nonce),
            quote(uri),
            response
        );
        if self.algorithm != Algorithm::Md5 {
            let _ = write!(out, ", algorithm={}", self.algorithm.name());
        }
        if let Some(qop) = self.qop {
            let _ = write!(out, ", qop={}, nc={NONCE_COUNT}, cnonce=\"{}\"", qop.name(), quote(cnonce));
        }
        if let Some(opaque) = &self.opaque {
            let _ = write!(out, ", opaque=\"{}\"", quote(opaque));
        }
        out
    }

    fn response(&self, username: &str, password: &str, method: &str, uri: &str, cnonce: &str) -> String {
        let mut ha1 = md5_hex(&format!("{username}:{}:{password}", self.realm));
        if self.algorithm == Algorithm::Md5Sess {
            ha1 = md5_hex(&format!("{ha1}:{}:{cnonce}", self.nonce));
        }

        let ha2 = match self.qop {
            Some(Qop::AuthInt) => md5_hex(&format!("{method}:{uri}:{}", md5_hex(""))),
            _ => md5_hex(&format!("{method}:{uri}")),
        };

        match self.qop {
            Some(qop) => md5_hex(&format!(
                "{ha1}:{}:{NONCE_COUNT}:{cnonce}:{}:{ha2}",
                self.nonce,
                qop.name()
            )),
            None => md5_hex(&format!("{ha1}:{}:{ha2}", self.nonce)),
        }
    }
}

/// A fresh client nonce
pub fn client_nonce() -> String {
    format!("{:016x}", rand::random::<u64>())
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// `key=value` and `key="quoted, value"` pairs, keys lowercased
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.trim().is_empty() {
            break;
        }
        if chars.next() != Some('=') {
            continue;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }

        params.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
    }

    params
}
