use itertools::Itertools;
use once_cell::sync;
use regex::Regex;

/// Go runtime version.
///
/// Pre-release builds carry `rev == -1` so that `go1.5beta2` orders below
/// `go1.5`. Development builds (`devel +<hash> ...`) have `major == -1` and
/// compare after-or-equal to every released version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoVersion {
    pub major: i32,
    pub minor: i32,
    pub rev: i32,
    pub beta: i32,
    pub rc: i32,
}

impl GoVersion {
    pub const fn release(major: i32, minor: i32, rev: i32) -> Self {
        GoVersion {
            major,
            minor,
            rev,
            beta: 0,
            rc: 0,
        }
    }

    const fn devel() -> Self {
        GoVersion {
            major: -1,
            minor: 0,
            rev: 0,
            beta: 0,
            rc: 0,
        }
    }

    /// Parse a runtime version string of the form `goX.Y[.Z|betaN|rcN]`
    /// or a development marker (`devel ...`).
    pub fn parse(s: &str) -> Option<Self> {
        static V_RE: sync::Lazy<Regex> = sync::Lazy::new(|| {
            Regex::new(r"^go(\d+)\.(\d+)(?:\.(\d+)|beta(\d+)|rc(\d+))?$").expect("must compile")
        });

        if s.starts_with("devel") {
            return Some(GoVersion::devel());
        }

        let caps = V_RE.captures(s)?;
        let group = |n: usize| {
            caps.get(n)
                .map(|m| m.as_str().parse::<i32>())
                .transpose()
                .ok()
                .flatten()
        };

        let mut ver = GoVersion::release(group(1)?, group(2)?, group(3).unwrap_or(0));
        if let Some(beta) = group(4) {
            ver.beta = beta;
            ver.rev = -1;
        }
        if let Some(rc) = group(5) {
            ver.rc = rc;
            ver.rev = -1;
        }
        Some(ver)
    }

    pub fn is_devel(&self) -> bool {
        self.major < 0
    }

    /// True if this version is greater than or equal to `other`.
    pub fn after_or_equal(&self, other: GoVersion) -> bool {
        if self.is_devel() {
            return true;
        }

        match self.major.cmp(&other.major) {
            std::cmp::Ordering::Less => return false,
            std::cmp::Ordering::Greater => return true,
            std::cmp::Ordering::Equal => {}
        }
        match self.minor.cmp(&other.minor) {
            std::cmp::Ordering::Less => return false,
            std::cmp::Ordering::Greater => return true,
            std::cmp::Ordering::Equal => {}
        }
        match self.rev.cmp(&other.rev) {
            std::cmp::Ordering::Less => return false,
            std::cmp::Ordering::Greater => return true,
            std::cmp::Ordering::Equal => {}
        }
        if self.beta < other.beta {
            return false;
        }
        self.rc >= other.rc
    }
}

/// First release where the scheduler keeps all goroutines in the
/// `runtime.allgs` slice instead of the `runtime.allg` array pointer.
pub const GO_1_5: GoVersion = GoVersion::release(1, 5, 0);

/// Supported runtime version diapasons.
static SUPPORTED_GO: &[(GoVersion, GoVersion)] = &[
    (GoVersion::release(1, 4, 0), GoVersion::release(1, 4, i32::MAX)),
    (GoVersion::release(1, 5, 0), GoVersion::release(1, 5, i32::MAX)),
];

pub fn supported_versions_to_string() -> String {
    format!(
        "[{}]",
        SUPPORTED_GO
            .iter()
            .map(|(v, _)| format!("{}.{}.x", v.major, v.minor))
            .join(", ")
    )
}

/// Check a runtime version, return true if a version supported, false otherwise.
/// Development builds always probe as supported.
pub fn probe_version(ver: GoVersion) -> bool {
    if ver.is_devel() {
        return true;
    }
    SUPPORTED_GO
        .iter()
        .any(|(v_min, v_max)| ver.after_or_equal(*v_min) && v_max.after_or_equal(ver))
}
