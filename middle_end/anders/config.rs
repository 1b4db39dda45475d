//! Options for the analysis.
//!
//! The compile-time constants mirror knobs that must be fixed per build;
//! everything else lives in `AndersConfig`, which drivers may deserialize
//! from JSON.

use serde::{Deserialize, Serialize};

/// Bits per sparse-bitmap element (must be a power of 2).  128 is the
/// common choice; 32, 64, or 256 may reduce time or memory in some cases.
pub const BM_ELSZ: u32 = 128;

/// Order in which nodes are removed from the active worklist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WlOrder {
    /// pop the least recently pushed
    Fifo,
    /// pop the most recently pushed
    Lifo,
    /// pop in order of increasing node ID
    Id,
    /// pop the lowest priority first (least recently fired)
    Prio,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AndersConfig {
    /// When false, struct layout information is dropped and every struct
    /// is treated as a single cell.
    pub field_sensitive: bool,
    /// Stop when the object/constraint identification is done.
    pub oci_only: bool,
    /// Skip the solve phase.
    pub no_solve: bool,
    /// Check for constraints with undefined sources.
    pub check_cons_undef: bool,
    /// Check for uninitialized global pointer fields.  Zero-initialized
    /// pointer fields get empty points-to sets either way; this only
    /// controls the diagnostic.
    pub check_global_null: bool,
    /// Record external functions used by the module but absent from the
    /// effect table.
    pub list_ext_unknown: bool,
    /// How much RAM (in MB) the process may use, checked during solving
    /// only.  0 disables the check.
    pub solve_ram_limit: u32,
    /// How long (in seconds) the solver may run.  0 disables the check.
    /// If either limit is exceeded the solver stops with a partial result.
    pub solve_time_limit: u64,
    pub wl_order: WlOrder,
    /// Use two worklists, pushing onto next, popping from current, and
    /// swapping when current is empty.
    pub dual_wl: bool,
    /// The set-to-vector cache may use at most `bvc_max` MB; `bvc_remove`
    /// MB are freed at once when it fills up.
    pub bvc_max: u32,
    pub bvc_remove: u32,
    /// Run LCD if there are at least `lcd_sz` candidate edges or if it has
    /// not run for `lcd_period` node visits.
    pub lcd_sz: usize,
    pub lcd_period: u32,
    /// Don't factor any load/store constraint group smaller than this
    /// (must be > 1).
    pub factor_ls_min_sz: usize,
    /// HR reruns HVN while at least this many constraints get deleted.
    pub hr_min_del: usize,
}

impl Default for AndersConfig {
    fn default() -> Self {
        AndersConfig {
            field_sensitive: true,
            oci_only: false,
            no_solve: false,
            check_cons_undef: true,
            check_global_null: false,
            list_ext_unknown: false,
            solve_ram_limit: 3600,
            solve_time_limit: 200,
            wl_order: WlOrder::Prio,
            dual_wl: true,
            bvc_max: 128,
            bvc_remove: 8,
            lcd_sz: 20,
            lcd_period: 50_000,
            factor_ls_min_sz: 2,
            hr_min_del: 100,
        }
    }
}
