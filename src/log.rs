use backtrace::Backtrace;
use nix::errno::{errno, Errno};
use std::{
    collections::HashMap,
    env,
    env::var_os,
    fs::{File, OpenOptions},
    io::{self, BufWriter, Result, Write},
    path::Path,
    sync::{Mutex, MutexGuard},
};

#[derive(Clone)]
struct LogModule {
    name: String,
    level: LogLevel,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    log_modules_cache: HashMap<String, LogModule>,
    /// Possibly buffered
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
}

extern "C" fn flush_log_buffer() {
    let mut lock = lock_globals();
    lock.log_file.flush().unwrap_or(());
}

fn open_log_file() -> Box<dyn Write + Send> {
    let maybe_filename = var_os("PMTRACE_LOG_FILE");
    let maybe_append_filename = var_os("PMTRACE_APPEND_LOG_FILE");
    let mut f: Box<dyn Write + Send> = Box::new(io::stderr());
    if let Some(filename) = maybe_filename {
        match File::create(&filename) {
            Ok(file) => f = Box::new(file),
            Err(e) => eprintln!(
                "Could not create `{:?}' named in PMTRACE_LOG_FILE ({}). Logging to stderr.",
                filename, e
            ),
        }
    } else if let Some(append_filename) = maybe_append_filename {
        match OpenOptions::new()
            .append(true)
            .create(true)
            .open(&append_filename)
        {
            Ok(file) => f = Box::new(file),
            Err(e) => eprintln!(
                "Could not append to `{:?}' named in PMTRACE_APPEND_LOG_FILE ({}). Logging to stderr.",
                append_filename, e
            ),
        }
    }

    if let Ok(buf_size) = env::var("PMTRACE_LOG_BUFFER") {
        match buf_size.parse::<usize>() {
            Ok(log_buffer_size) => f = Box::new(BufWriter::with_capacity(log_buffer_size, f)),
            Err(_) => eprintln!(
                "Could not parse `{}' in PMTRACE_LOG_BUFFER as a number. Log is unbuffered.",
                buf_size
            ),
        }
    }
    f
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let log_file = open_log_file();

        let ret = unsafe {
            libc::atexit(flush_log_buffer)
        };
        debug_assert_eq!(ret, 0);

        let (default_level, level_map) = match env::var("PMTRACE_LOG") {
            Ok(pm_log) => init_log_levels(&pm_log),
            Err(_) => (LogError, HashMap::new())
        };

        Mutex::new(LogGlobals {
            level_map,
            log_modules_cache: HashMap::new(),
            log_file,
            default_level,
        })
    };
}

/// A panic while logging must not take logging down with it.
fn lock_globals() -> MutexGuard<'static, LogGlobals> {
    LOG_GLOBALS.lock().unwrap_or_else(|e| e.into_inner())
}

fn log_level_string_to_level(log_level_string: &str) -> LogLevel {
    match log_level_string {
        "fatal" => LogFatal,
        "error" => LogError,
        "warn" => LogWarn,
        "info" => LogInfo,
        "debug" => LogDebug,
        _ => LogWarn,
    }
}

fn init_log_levels(pm_log: &str) -> (LogLevel, HashMap<String, LogLevel>) {
    let mut hm: HashMap<String, LogLevel> = HashMap::new();
    let mut default_level = LogDebug;
    for mod_colon_level in pm_log.split(',') {
        let res: Vec<&str> = mod_colon_level.splitn(2, ':').collect();
        if res.len() == 2 {
            let mod_name = res[0].trim();
            let log_level_string = res[1].trim();
            if mod_name == "all" {
                default_level = log_level_string_to_level(log_level_string);
            } else {
                hm.insert(
                    mod_name.to_owned(),
                    log_level_string_to_level(log_level_string),
                );
            }
        }
    }
    (default_level, hm)
}

fn get_log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    // Module names are file stems and stay case sensitive.
    match l.level_map.get(module_name) {
        Some(log_level) => *log_level,
        None => l.default_level,
    }
}

fn filename_to_module_name(filename: &str) -> String {
    let path = Path::new(filename);
    match path.file_stem() {
        Some(stem) => stem.to_string_lossy().to_string(),
        None => filename.to_owned(),
    }
}

fn get_log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    if let Some(log_module) = l.log_modules_cache.get(filename) {
        log_module.to_owned()
    } else {
        let name = filename_to_module_name(filename);
        let level = get_log_level(&name, l);
        let m = LogModule { level, name };
        l.log_modules_cache.insert(filename.to_owned(), m.clone());
        m
    }
}

/// Change the level every module without an explicit override logs at.
/// The replay `--verbosity` option ends up here.
pub fn set_default_level(level: LogLevel) {
    let mut l = lock_globals();
    l.default_level = level;
    l.log_modules_cache.clear();
}

pub fn set_logging(module_name: &str, level: LogLevel) {
    let mut l = lock_globals();
    l.level_map.insert(module_name.to_owned(), level);
    l.log_modules_cache.clear();
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

pub struct NewLineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        module_path: &str,
        always_enabled: bool,
    ) -> Option<NewLineTerminatingOstream> {
        let mut lock = lock_globals();
        let m = get_log_module(filename, &mut lock);
        let enabled = always_enabled || level <= m.level;
        if enabled {
            let mut stream = NewLineTerminatingOstream {
                message: Vec::new(),
                enabled,
                lock,
            };
            if level == LogDebug {
                write!(stream, "[{}] ", m.name).unwrap_or(());
            } else {
                write_prefix(&mut stream, level, filename, line, module_path);
            }

            Some(stream)
        } else {
            None
        }
    }
}

/// Low level. Use is_logging!() macro instead.
pub fn is_logging(level: LogLevel, filename: &str, _line: u32, _func_name: &str) -> bool {
    let mut lock = lock_globals();
    let m = get_log_module(filename, &mut lock);
    level <= m.level
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.write(b"\n").unwrap_or(0);
            // Moves the message into the log file. The log file itself is
            // flushed at exit.
            self.flush().unwrap_or(());
        }
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }

        // Claim the bytes were written even when disabled, otherwise write!()
        // reports WriteZero.
        Ok(buf.len())
    }
}

pub fn write_prefix(
    stream: &mut dyn Write,
    level: LogLevel,
    filename: &str,
    line: u32,
    _module_path: &str,
) {
    write!(stream, "[{} {}:{}", log_name(level), filename, line).unwrap_or(());

    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {:?}", Errno::from_i32(err)).unwrap_or(());
    }
    write!(stream, "] ").unwrap_or(());
}

/// This is almost always not the method you want. Use log!() macro instead
pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
    always_enabled: bool,
) -> Option<NewLineTerminatingOstream> {
    NewLineTerminatingOstream::new(log_level, filename, line, module_path, always_enabled)
}

/// Outputs to (possibly write buffered) log file (or stderr if no log file was specified)
/// After this program continues normally.
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            let maybe_stream = crate::log::log(
                $log_level,
                file!(),
                line!(),
                module_path!(),
                false
            );
            match maybe_stream {
                Some(mut stream) => write!(stream, $($args)+).unwrap_or(()),
                None => ()
            }
        }
    };
}

macro_rules! is_logging {
    ($log_level:expr) => {
        crate::log::is_logging($log_level, file!(), line!(), module_path!())
    };
}

/// Outputs to (possibly write buffered) log file (or stderr if no log file was specified)
/// Prints out the backtrace to stderr and aborts.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let maybe_stream = crate::log::log(
                    LogFatal,
                    file!(),
                    line!(),
                    module_path!(),
                    true
                );
                match maybe_stream {
                   Some(mut stream) => write!(stream, $($args)+).unwrap_or(()),
                   None => ()
                }
            }
            crate::log::notifying_abort(backtrace::Backtrace::new());
            unreachable!();
        }
    };
}

/// Output to stderr always. No backtrace -- simply exit.
macro_rules! clean_fatal {
    ($($args:tt)+) => {
        {
            use std::io::stderr;
            crate::log::flush();
            crate::log::write_prefix(&mut stderr(), crate::log::LogLevel::LogFatal, file!(), line!(), module_path!());
            eprintln!($($args)+);
            std::process::exit(1);
        }
    };
}

pub fn flush() {
    flush_log_buffer();
}

/// Dump the stacktrace and abort.
pub fn notifying_abort(bt: Backtrace) {
    flush_log_buffer();
    dump_pmtrace_stack(bt);
    std::process::abort();
}

fn dump_pmtrace_stack(bt: Backtrace) {
    eprintln!("=== Start pmtrace backtrace:");
    eprintln!("{:?}", bt);
    eprintln!("=== End pmtrace backtrace");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn parses_module_levels() {
        let (default_level, levels) = init_log_levels("all:warn, sequencer:debug,pageguard:bogus");
        assert_eq!(default_level, LogWarn);
        assert_eq!(levels.get("sequencer"), Some(&LogDebug));
        assert_eq!(levels.get("pageguard"), Some(&LogWarn));
        assert_eq!(levels.get("dispatcher"), None);
    }

    #[test]
    pub fn unset_all_means_debug() {
        let (default_level, levels) = init_log_levels("object_remapper:info");
        assert_eq!(default_level, LogDebug);
        assert_eq!(levels.len(), 1);
    }

    #[test]
    pub fn module_name_is_file_stem() {
        assert_eq!(filename_to_module_name("src/replay/sequencer.rs"), "sequencer");
        assert!(LogError < LogWarn);
    }
}
