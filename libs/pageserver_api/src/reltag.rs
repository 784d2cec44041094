use std::fmt;
use std::str::FromStr;

use postgres_ffi_types::forknum::forknumber_to_name;
use postgres_ffi_types::Oid;

/// One fork of a relation: the tablespace, database and relation oids of the
/// relfilenode plus the fork number.
///
/// This is the unit the storage manager opens, sizes and caches. Ordering
/// groups the forks of a relation together, main fork first.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct RelTag {
    pub spcnode: Oid,
    pub dbnode: Oid,
    pub relnode: Oid,
    pub forknum: u8,
}

/// `spc/db/rel`, with `_fsm`, `_vm` or `_init` appended for the other forks,
/// like relpathperm() in server log messages.
impl fmt::Display for RelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.spcnode, self.dbnode, self.relnode)?;
        match forknumber_to_name(self.forknum) {
            Some(fork) => write!(f, "_{fork}"),
            None => Ok(()),
        }
    }
}

impl RelTag {
    /// Another fork of the same relation.
    pub fn with_forknum(&self, forknum: u8) -> Self {
        RelTag { forknum, ..*self }
    }
}

/// The cluster-wide transaction status logs kept in SLRU buffers. Their files
/// are split into segments of BLCKSZ pages.
///
/// Discriminants are the wire values of GetSlruPage requests.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SlruKind {
    Clog = 0,
    MultiXactMembers = 1,
    MultiXactOffsets = 2,
    Csnlog = 3,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown SLRU kind {0:?}")]
pub struct SlruKindParseError(pub String);

impl SlruKind {
    pub const ALL: [SlruKind; 4] = [
        Self::Clog,
        Self::MultiXactMembers,
        Self::MultiXactOffsets,
        Self::Csnlog,
    ];

    /// Directory name of the SLRU under the data directory, which is also its
    /// canonical string form.
    pub fn to_str(&self) -> &'static str {
        match self {
            Self::Clog => "pg_xact",
            Self::MultiXactMembers => "pg_multixact/members",
            Self::MultiXactOffsets => "pg_multixact/offsets",
            Self::Csnlog => "pg_csnlog",
        }
    }
}

impl fmt::Display for SlruKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_str())
    }
}

impl FromStr for SlruKind {
    type Err = SlruKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SlruKind::ALL
            .into_iter()
            .find(|kind| kind.to_str() == s)
            .ok_or_else(|| SlruKindParseError(s.to_owned()))
    }
}

impl TryFrom<u8> for SlruKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Self::Clog),
            1 => Ok(Self::MultiXactMembers),
            2 => Ok(Self::MultiXactOffsets),
            3 => Ok(Self::Csnlog),
            _ => Err(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postgres_ffi_types::forknum::{FSM_FORKNUM, MAIN_FORKNUM};

    #[test]
    fn slru_kind_string_roundtrip() {
        for kind in SlruKind::ALL {
            assert_eq!(kind.to_str().parse::<SlruKind>(), Ok(kind));
            assert_eq!(SlruKind::try_from(kind as u8), Ok(kind));
        }
        assert_eq!(
            "bogus".parse::<SlruKind>(),
            Err(SlruKindParseError("bogus".to_owned()))
        );
        // exact match only
        "PG_XACT".parse::<SlruKind>().unwrap_err();
        "pg_xact/".parse::<SlruKind>().unwrap_err();
        assert_eq!(SlruKind::try_from(4), Err(4));
    }

    #[test]
    fn reltag_display_and_order() {
        let main = RelTag {
            spcnode: 1663,
            dbnode: 5,
            relnode: 16384,
            forknum: MAIN_FORKNUM,
        };
        let fsm = main.with_forknum(FSM_FORKNUM);
        assert_eq!(main.to_string(), "1663/5/16384");
        assert_eq!(fsm.to_string(), "1663/5/16384_fsm");
        assert!(main < fsm);

        let other_rel = RelTag {
            relnode: 16385,
            ..main
        };
        assert!(fsm < other_rel);
    }
}
