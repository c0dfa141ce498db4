//! The fixed `/$system` table.
//!
//! | name                    | access | semantics                               |
//! |-------------------------|--------|-----------------------------------------|
//! | `info`                  | R      | identifying text                        |
//! | `handles`               | R      | open-file table dump                    |
//! | `tfs.bin`               | R/W    | read or replace the in-memory overlay   |
//! | `force_immediate_flush` | W      | any write triggers a flush              |

/// Identity text served by `/$system/info`.
pub const INFO_TEXT: &str = concat!(
    "mdfs: NetMD MiniDisc overlay filesystem, version ",
    env!("CARGO_PKG_VERSION"),
    "\n"
);

pub const INFO: &str = "info";
pub const HANDLES: &str = "handles";
pub const TFS_BIN: &str = "tfs.bin";
pub const FORCE_FLUSH: &str = "force_immediate_flush";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemFile {
    pub name: &'static str,
    pub readable: bool,
    pub writable: bool,
}

pub const SYSTEM_FILES: &[SystemFile] = &[
    SystemFile {
        name: INFO,
        readable: true,
        writable: false,
    },
    SystemFile {
        name: HANDLES,
        readable: true,
        writable: false,
    },
    SystemFile {
        name: TFS_BIN,
        readable: true,
        writable: true,
    },
    SystemFile {
        name: FORCE_FLUSH,
        readable: false,
        writable: true,
    },
];

#[must_use]
pub fn lookup(name: &str) -> Option<&'static SystemFile> {
    SYSTEM_FILES.iter().find(|file| file.name == name)
}

/// Mode bits: `0o111 | (0o444 if readable) | (0o222 if writable)`.
#[must_use]
pub fn perm(file: &SystemFile) -> u16 {
    let mut mode = 0o111;
    if file.readable {
        mode |= 0o444;
    }
    if file.writable {
        mode |= 0o222;
    }
    mode
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lookup_and_permissions() {
        assert_eq!(perm(lookup(INFO).unwrap()), 0o555);
        assert_eq!(perm(lookup(HANDLES).unwrap()), 0o555);
        assert_eq!(perm(lookup(TFS_BIN).unwrap()), 0o777);
        assert_eq!(perm(lookup(FORCE_FLUSH).unwrap()), 0o333);
        assert!(lookup("unknown").is_none());
    }
}
