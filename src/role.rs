use std::fmt;
use std::io::{Error, ErrorKind};
use std::str::FromStr;

/// Length of every role token on the wire.
pub const ROLE_TOKEN_LEN: usize = 3;

/// HTTP/2 connection preface sent first by ordinary clients.
pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub(crate) const ROLE_COUNT: usize = 3;

/// Identity a reverse-dialed connection announces in its first bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Edge lifecycle agent.
    Ela,
    /// Edge virtualization agent.
    Eva,
    /// Edge DNS agent.
    Eda,
}

const ROLE_TOKENS: [(Role, &[u8; ROLE_TOKEN_LEN]); ROLE_COUNT] = [
    (Role::Ela, b"ELA"),
    (Role::Eva, b"EVA"),
    (Role::Eda, b"EDA"),
];

impl Role {
    pub const ALL: [Role; ROLE_COUNT] = [Role::Ela, Role::Eva, Role::Eda];

    pub fn token(self) -> &'static [u8; ROLE_TOKEN_LEN] {
        ROLE_TOKENS[self.index()].1
    }

    pub fn from_token(token: &[u8]) -> Option<Role> {
        ROLE_TOKENS
            .iter()
            .find(|(_, t)| t.as_slice() == token)
            .map(|(role, _)| *role)
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Role::Ela => 0,
            Role::Eva => 1,
            Role::Eda => 2,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = self.token();
        write!(f, "{}", String::from_utf8_lossy(token))
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::from_token(s.to_ascii_uppercase().as_bytes())
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, format!("unknown role {}", s)))
    }
}

/// What the first bytes of an inbound connection declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Preface {
    Role(Role),
    /// Starts like the HTTP/2 client preface.
    Client,
    /// Short read or a prefix nobody claims.
    Unknown,
}

impl Preface {
    pub fn classify(initial: &[u8]) -> Preface {
        if let Some(role) = Role::from_token(initial) {
            return Preface::Role(role);
        }
        if !initial.is_empty() && is_prefix(initial, CLIENT_PREFACE) {
            Preface::Client
        } else {
            Preface::Unknown
        }
    }

    /// Whether more bytes could still turn `initial` into a role token.
    pub(crate) fn undecided(initial: &[u8]) -> bool {
        initial.len() < ROLE_TOKEN_LEN && ROLE_TOKENS.iter().any(|(_, t)| is_prefix(initial, *t))
    }
}

fn is_prefix(got: &[u8], want: &[u8]) -> bool {
    got.len() <= want.len() && got.iter().zip(want).all(|(a, b)| a == b)
}
