//! X/Open XA flags, return codes and the resource-level error type

use std::fmt;

// ============================================================================
// XA Flags
// ============================================================================

/// No flags set.
pub const TMNOFLAGS: i32 = 0x0000_0000;

/// Caller is joining an existing transaction branch.
pub const TMJOIN: i32 = 0x0020_0000;

/// Caller is resuming association with a suspended branch.
pub const TMRESUME: i32 = 0x0800_0000;

/// Dissociate caller from the branch, work succeeded.
pub const TMSUCCESS: i32 = 0x0400_0000;

/// Dissociate caller from the branch, work failed.
pub const TMFAIL: i32 = 0x2000_0000;

/// Suspend (not end) the association with the branch.
pub const TMSUSPEND: i32 = 0x0200_0000;

/// Start a recovery scan.
pub const TMSTARTRSCAN: i32 = 0x0100_0000;

/// End a recovery scan.
pub const TMENDRSCAN: i32 = 0x0080_0000;

/// Use the one-phase commit optimization.
pub const TMONEPHASE: i32 = 0x4000_0000;

// ============================================================================
// XA Return Codes
// ============================================================================

/// Normal execution.
pub const XA_OK: i32 = 0;

/// Routine returned with no effect and may be reissued.
pub const XA_RETRY: i32 = 4;

/// The branch was read-only and has been committed.
pub const XA_RDONLY: i32 = 3;

/// The branch was partially committed and partially rolled back.
pub const XA_HEURMIX: i32 = 5;

/// The branch was heuristically rolled back.
pub const XA_HEURRB: i32 = 6;

/// The branch was heuristically committed.
pub const XA_HEURCOM: i32 = 7;

/// The branch may have been heuristically completed.
pub const XA_HEURHAZ: i32 = 8;

/// The resource manager does not know the branch after a heuristic decision.
pub const XA_NOMIGRATE: i32 = 9;

/// Lower bound of the rollback codes.
pub const XA_RBBASE: i32 = 100;
pub const XA_RBROLLBACK: i32 = XA_RBBASE;
pub const XA_RBCOMMFAIL: i32 = XA_RBBASE + 1;
pub const XA_RBDEADLOCK: i32 = XA_RBBASE + 2;
pub const XA_RBINTEGRITY: i32 = XA_RBBASE + 3;
pub const XA_RBOTHER: i32 = XA_RBBASE + 4;
pub const XA_RBPROTO: i32 = XA_RBBASE + 5;
pub const XA_RBTIMEOUT: i32 = XA_RBBASE + 6;
pub const XA_RBTRANSIENT: i32 = XA_RBBASE + 7;
/// Upper bound of the rollback codes.
pub const XA_RBEND: i32 = XA_RBTRANSIENT;

// ============================================================================
// XA Error Codes
// ============================================================================

/// Asynchronous operation already outstanding.
pub const XAER_ASYNC: i32 = -2;
/// A resource manager error occurred in the branch.
pub const XAER_RMERR: i32 = -3;
/// The XID is not valid.
pub const XAER_NOTA: i32 = -4;
/// Invalid arguments were given.
pub const XAER_INVAL: i32 = -5;
/// Routine invoked in an improper context.
pub const XAER_PROTO: i32 = -6;
/// Resource manager unavailable.
pub const XAER_RMFAIL: i32 = -7;
/// The XID already exists.
pub const XAER_DUPID: i32 = -8;
/// Resource manager doing work outside a global transaction.
pub const XAER_OUTSIDE: i32 = -9;

/// Vote returned by `prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vote {
    /// The branch is prepared and takes part in the commit phase.
    Ok,
    /// The branch made no durable change and is already complete.
    ReadOnly,
}

impl Vote {
    /// Map an XA return code to a vote
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            XA_OK => Some(Vote::Ok),
            XA_RDONLY => Some(Vote::ReadOnly),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Vote::Ok => XA_OK,
            Vote::ReadOnly => XA_RDONLY,
        }
    }
}

/// Error reported by a resource manager, the `XAException` equivalent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XaError {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for XaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", code_name(self.code), self.code, self.message)
    }
}

impl std::error::Error for XaError {}

impl XaError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Resource manager failure, typically a lost connection
    pub fn rm_fail(message: impl Into<String>) -> Self {
        Self::new(XAER_RMFAIL, message)
    }

    /// Generic resource manager error
    pub fn rm_err(message: impl Into<String>) -> Self {
        Self::new(XAER_RMERR, message)
    }

    /// Unknown branch
    pub fn not_a(message: impl Into<String>) -> Self {
        Self::new(XAER_NOTA, message)
    }

    /// The resource unilaterally completed the branch
    pub fn is_heuristic(&self) -> bool {
        matches!(
            self.code,
            XA_HEURMIX | XA_HEURRB | XA_HEURCOM | XA_HEURHAZ
        )
    }

    /// The resource rolled the branch back on its own
    pub fn is_rollback(&self) -> bool {
        (XA_RBBASE..=XA_RBEND).contains(&self.code)
    }

    /// Communication failure; the operation may succeed when retried
    pub fn is_transient(&self) -> bool {
        matches!(self.code, XAER_RMFAIL | XA_RETRY | XA_RBCOMMFAIL | XA_RBTRANSIENT)
    }

    /// The resource does not know the branch
    pub fn is_unknown_branch(&self) -> bool {
        self.code == XAER_NOTA
    }
}

/// Symbolic name of an XA return or error code
pub fn code_name(code: i32) -> &'static str {
    match code {
        XA_OK => "XA_OK",
        XA_RDONLY => "XA_RDONLY",
        XA_RETRY => "XA_RETRY",
        XA_HEURMIX => "XA_HEURMIX",
        XA_HEURRB => "XA_HEURRB",
        XA_HEURCOM => "XA_HEURCOM",
        XA_HEURHAZ => "XA_HEURHAZ",
        XA_NOMIGRATE => "XA_NOMIGRATE",
        XA_RBROLLBACK => "XA_RBROLLBACK",
        XA_RBCOMMFAIL => "XA_RBCOMMFAIL",
        XA_RBDEADLOCK => "XA_RBDEADLOCK",
        XA_RBINTEGRITY => "XA_RBINTEGRITY",
        XA_RBOTHER => "XA_RBOTHER",
        XA_RBPROTO => "XA_RBPROTO",
        XA_RBTIMEOUT => "XA_RBTIMEOUT",
        XA_RBTRANSIENT => "XA_RBTRANSIENT",
        XAER_ASYNC => "XAER_ASYNC",
        XAER_RMERR => "XAER_RMERR",
        XAER_NOTA => "XAER_NOTA",
        XAER_INVAL => "XAER_INVAL",
        XAER_PROTO => "XAER_PROTO",
        XAER_RMFAIL => "XAER_RMFAIL",
        XAER_DUPID => "XAER_DUPID",
        XAER_OUTSIDE => "XAER_OUTSIDE",
        _ => "XA_UNKNOWN",
    }
}

/// Human readable rendering of an XA flag word
pub struct Flags(pub i32);

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(i32, &str); 8] = [
            (TMJOIN, "TMJOIN"),
            (TMRESUME, "TMRESUME"),
            (TMSUCCESS, "TMSUCCESS"),
            (TMFAIL, "TMFAIL"),
            (TMSUSPEND, "TMSUSPEND"),
            (TMSTARTRSCAN, "TMSTARTRSCAN"),
            (TMENDRSCAN, "TMENDRSCAN"),
            (TMONEPHASE, "TMONEPHASE"),
        ];

        if self.0 == TMNOFLAGS {
            return f.write_str("TMNOFLAGS");
        }
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.0 & flag != 0)
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join("|"))
    }
}
