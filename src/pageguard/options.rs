use crate::{log::LogLevel::LogWarn, util::parse_u64_auto};
use std::{convert::TryFrom, env};

/// Default for `PMTRACE_PMB_TARGET_RANGE_SIZE`.
pub const DEFAULT_TARGET_RANGE_SIZE: usize = 0x800;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageGuardOptions {
    pub enabled: bool,
    /// Mappings smaller than this are captured as whole ranges.
    pub target_range_size: usize,
    pub read_tracking: bool,
    pub read_post_process: bool,
    pub lazy_copy: bool,
    pub sync_gpu_data_back: bool,
    /// Number of presented frames during which the handler watchdog runs.
    pub check_handler_frames: u32,
    pub flush_remap: bool,
}

impl Default for PageGuardOptions {
    fn default() -> Self {
        PageGuardOptions {
            enabled: true,
            target_range_size: DEFAULT_TARGET_RANGE_SIZE,
            read_tracking: false,
            read_post_process: false,
            lazy_copy: false,
            sync_gpu_data_back: false,
            check_handler_frames: 0,
            flush_remap: false,
        }
    }
}

fn flag_set(value: Option<String>) -> bool {
    match value {
        Some(v) => {
            let v = v.trim();
            !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false")
        }
        None => false,
    }
}

impl PageGuardOptions {
    /// Build options from an arbitrary variable lookup. Unparseable values
    /// fall back to the default for that option.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> PageGuardOptions {
        let mut opts = PageGuardOptions::default();
        if let Some(v) = lookup("PMTRACE_PMB_ENABLE") {
            // 2 selects external host memory on platforms that have it. Here
            // it behaves like 1.
            opts.enabled = match v.trim() {
                "0" => false,
                _ => true,
            };
        }
        if let Some(v) = lookup("PMTRACE_PMB_TARGET_RANGE_SIZE") {
            let v = v.trim();
            let hex = v.trim_start_matches("0x").trim_start_matches("0X");
            if let Ok(n) = u64::from_str_radix(hex, 16) {
                opts.target_range_size = n as usize;
            }
        }
        opts.read_tracking = flag_set(lookup("PMTRACE_PAGEGUARD_ENABLE_READ_PMB"));
        opts.read_post_process = flag_set(lookup("PMTRACE_PAGEGUARD_ENABLE_READ_POST_PROCESS"));
        opts.lazy_copy = flag_set(lookup("PMTRACE_PAGEGUARD_ENABLE_LAZY_COPY"));
        opts.sync_gpu_data_back = flag_set(lookup("PMTRACE_PAGEGUARD_ENABLE_SYNC_GPU_DATA_BACK"));
        if let Some(v) = lookup("PMTRACE_CHECK_PAGEGUARD_HANDLER_IN_FRAMES") {
            match parse_u64_auto(v.trim()).map(u32::try_from) {
                Some(Ok(n)) => opts.check_handler_frames = n,
                Some(Err(_)) => log!(
                    LogWarn,
                    "PMTRACE_CHECK_PAGEGUARD_HANDLER_IN_FRAMES={} is out of range; ignored",
                    v.trim()
                ),
                None => (),
            }
        }
        opts.flush_remap = flag_set(lookup("PMTRACE_ENABLE_FLUSH_REMAP"));
        opts
    }
}

lazy_static! {
    static ref OPTIONS: PageGuardOptions = PageGuardOptions::from_lookup(|k| env::var(k).ok());
}

/// Process wide options, read from the environment on first use.
pub fn options() -> &'static PageGuardOptions {
    &OPTIONS
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn lookup_in(vars: &[(&str, &str)]) -> PageGuardOptions {
        let m: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PageGuardOptions::from_lookup(|k| m.get(k).cloned())
    }

    #[test]
    pub fn defaults_without_environment() {
        assert_eq!(lookup_in(&[]), PageGuardOptions::default());
        assert!(PageGuardOptions::default().enabled);
        assert_eq!(PageGuardOptions::default().target_range_size, 0x800);
    }

    #[test]
    pub fn parses_each_variable() {
        let o = lookup_in(&[
            ("PMTRACE_PMB_ENABLE", "0"),
            ("PMTRACE_PMB_TARGET_RANGE_SIZE", "0x10000"),
            ("PMTRACE_PAGEGUARD_ENABLE_READ_PMB", "1"),
            ("PMTRACE_PAGEGUARD_ENABLE_LAZY_COPY", "true"),
            ("PMTRACE_CHECK_PAGEGUARD_HANDLER_IN_FRAMES", "30"),
        ]);
        assert!(!o.enabled);
        assert_eq!(o.target_range_size, 0x10000);
        assert!(o.read_tracking);
        assert!(o.lazy_copy);
        assert!(!o.read_post_process);
        assert_eq!(o.check_handler_frames, 30);

        let o = lookup_in(&[
            ("PMTRACE_PMB_ENABLE", "2"),
            ("PMTRACE_PMB_TARGET_RANGE_SIZE", "1000"),
            ("PMTRACE_ENABLE_FLUSH_REMAP", "0"),
        ]);
        assert!(o.enabled);
        assert_eq!(o.target_range_size, 0x1000);
        assert!(!o.flush_remap);
    }

    #[test]
    pub fn out_of_range_frame_count_is_ignored() {
        let o = lookup_in(&[("PMTRACE_CHECK_PAGEGUARD_HANDLER_IN_FRAMES", "0x100000001")]);
        assert_eq!(o.check_handler_frames, 0);
        let o = lookup_in(&[("PMTRACE_CHECK_PAGEGUARD_HANDLER_IN_FRAMES", "0xffffffff")]);
        assert_eq!(o.check_handler_frames, u32::MAX);
    }
}
