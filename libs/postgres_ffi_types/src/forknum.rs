//! Relation fork numbers, from common/relpath.h
//!
//! Each relation has a main fork holding its data and optional forks with
//! auxiliary information, stored in files with a fork-specific suffix.

pub const MAIN_FORKNUM: u8 = 0;
pub const FSM_FORKNUM: u8 = 1;
pub const VISIBILITYMAP_FORKNUM: u8 = 2;
pub const INIT_FORKNUM: u8 = 3;

/// File name suffix of a fork, `None` for the main fork.
pub fn forknumber_to_name(forknum: u8) -> Option<&'static str> {
    match forknum {
        MAIN_FORKNUM => None,
        FSM_FORKNUM => Some("fsm"),
        VISIBILITYMAP_FORKNUM => Some("vm"),
        INIT_FORKNUM => Some("init"),
        _ => Some("UNKNOWN FORKNUM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(MAIN_FORKNUM, None)]
    #[case(FSM_FORKNUM, Some("fsm"))]
    #[case(VISIBILITYMAP_FORKNUM, Some("vm"))]
    #[case(INIT_FORKNUM, Some("init"))]
    #[case(42, Some("UNKNOWN FORKNUM"))]
    fn fork_names(#[case] forknum: u8, #[case] name: Option<&str>) {
        assert_eq!(forknumber_to_name(forknum), name);
    }
}
