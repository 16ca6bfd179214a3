//! Section-name to attach-type classification.
//!
//! Entry points announce their attach type through the name of the ELF
//! section they are compiled into ("kprobe/do_unlinkat" and so on). The
//! set of attach types grows over time; supporting a new one means adding
//! a row here, nothing else.

use crate::sys::ProgramType;

pub struct SecDef {
    pub sec: &'static str,
    pub prog_type: ProgramType,
}

/// Ordered table: first match wins, so longer or more specific entries
/// must come before shorter ones.
pub static SECTION_DEFS: &[SecDef] = &[
    SecDef { sec: "kprobe/", prog_type: ProgramType::Kprobe },
    SecDef { sec: "kretprobe/", prog_type: ProgramType::Kprobe },
    SecDef { sec: "tracepoint/", prog_type: ProgramType::Tracepoint },
    SecDef { sec: "tp/", prog_type: ProgramType::Tracepoint },
    SecDef { sec: "xdp", prog_type: ProgramType::Xdp },
    SecDef { sec: "perf_event", prog_type: ProgramType::PerfEvent },
    SecDef { sec: "tc", prog_type: ProgramType::SchedCls },
];

/// An entry ending in `/` matches any section it prefixes; anything else
/// must match exactly.
fn sec_def_matches(def: &SecDef, sec_name: &str) -> bool {
    if def.sec.ends_with('/') {
        sec_name.starts_with(def.sec)
    } else {
        sec_name == def.sec
    }
}

pub fn find_sec_def(sec_name: &str) -> Option<&'static SecDef> {
    SECTION_DEFS.iter().find(|def| sec_def_matches(def, sec_name))
}
