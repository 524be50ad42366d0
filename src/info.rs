use std::fmt;

/// Replication id advertised by a primary. Static for now: nothing in
/// the replication flow distinguishes processes by id, so a fixed
/// 40-character literal keeps handshakes reproducible.
const MASTER_REPL_ID: &str = "8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Replica,
}

impl Role {
    /// The role name used on the wire (INFO output).
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Replica => "slave",
        }
    }
}

/// Process-wide replication identity, fixed at startup.
#[derive(Debug)]
pub struct ServerInfo {
    role: Role,
    master_replid: String,
    master_repl_offset: u64,
}

impl ServerInfo {
    pub fn master() -> ServerInfo {
        ServerInfo::new(Role::Master)
    }

    pub fn replica() -> ServerInfo {
        ServerInfo::new(Role::Replica)
    }

    fn new(role: Role) -> ServerInfo {
        ServerInfo {
            role,
            master_replid: MASTER_REPL_ID.to_string(),
            master_repl_offset: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn master_replid(&self) -> &str {
        &self.master_replid
    }
}

impl fmt::Display for ServerInfo {
    /// The replication block served by INFO. Lines end with CRLF,
    /// terminal newline included.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "# Replication\r\nrole:{}\r\nmaster_replid:{}\r\nmaster_repl_offset:{}\r\n",
            self.role.as_str(),
            self.master_replid,
            self.master_repl_offset,
        )
    }
}
