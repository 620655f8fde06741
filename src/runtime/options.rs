use crate::runtime::{ConfigError, class_linker::ClassPathArchive, hooks::RuntimeHooks};
use bitflags::bitflags;
use nom::{
    IResult, Parser,
    character::complete::{digit1, one_of},
    combinator::{all_consuming, map_res, opt},
};
use std::{env, fmt, sync::Arc, thread};
use tracing::debug;

const KB: usize = 1024;
const MB: usize = KB * KB;
const GB: usize = KB * KB * KB;

/// One option handed to [`crate::Runtime::create`]. Most options are plain
/// command-line style strings; the rest carry values that cannot be spelled
/// as text.
#[derive(Clone)]
pub enum RuntimeOption {
    Arg(String),
    /// Pre-opened boot class path, taking precedence over `-Xbootclasspath:`.
    BootClassPath(Vec<Arc<ClassPathArchive>>),
    HostPrefix(String),
    Hooks(Arc<dyn RuntimeHooks>),
}

impl From<&str> for RuntimeOption {
    fn from(arg: &str) -> Self {
        RuntimeOption::Arg(arg.to_string())
    }
}

impl From<String> for RuntimeOption {
    fn from(arg: String) -> Self {
        RuntimeOption::Arg(arg)
    }
}

impl fmt::Debug for RuntimeOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeOption::Arg(arg) => f.debug_tuple("Arg").field(arg).finish(),
            RuntimeOption::BootClassPath(archives) => f
                .debug_tuple("BootClassPath")
                .field(&archives.iter().map(|a| a.location()).collect::<Vec<_>>())
                .finish(),
            RuntimeOption::HostPrefix(prefix) => f.debug_tuple("HostPrefix").field(prefix).finish(),
            RuntimeOption::Hooks(hooks) => f.debug_tuple("Hooks").field(hooks).finish(),
        }
    }
}

bitflags! {
    /// Subsystems selected with `-verbose:`.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct LogVerbosity: u16 {
        const CLASS_LINKER = 1 << 0;
        const COMPILER = 1 << 1;
        const HEAP = 1 << 2;
        const GC = 1 << 3;
        const JDWP = 1 << 4;
        const JNI = 1 << 5;
        const MONITOR = 1 << 6;
        const STARTUP = 1 << 7;
        const THIRD_PARTY_JNI = 1 << 8;
        const THREADS = 1 << 9;
    }
}

impl LogVerbosity {
    pub fn from_tag(tag: &str) -> Option<LogVerbosity> {
        Some(match tag {
            "class" => LogVerbosity::CLASS_LINKER,
            "compiler" => LogVerbosity::COMPILER,
            "heap" => LogVerbosity::HEAP,
            "gc" => LogVerbosity::GC,
            "jdwp" => LogVerbosity::JDWP,
            "jni" => LogVerbosity::JNI,
            "monitor" => LogVerbosity::MONITOR,
            "startup" => LogVerbosity::STARTUP,
            "third-party-jni" => LogVerbosity::THIRD_PARTY_JNI,
            "threads" => LogVerbosity::THREADS,
            _ => return None,
        })
    }

    /// Parses a comma separated `-verbose:` tag list.
    pub fn parse_tags(tags: &str) -> Option<LogVerbosity> {
        tags.split(',')
            .try_fold(LogVerbosity::empty(), |acc, tag| Some(acc | LogVerbosity::from_tag(tag)?))
    }

    /// `tracing_subscriber::EnvFilter` directives enabling debug output for
    /// the selected subsystems.
    pub fn env_filter_directives(self) -> String {
        let mut directives = vec!["info".to_string()];
        let targets = [
            (LogVerbosity::CLASS_LINKER, "jrt::runtime::class_linker"),
            (LogVerbosity::HEAP | LogVerbosity::GC, "jrt::runtime::heap"),
            (LogVerbosity::JNI | LogVerbosity::THIRD_PARTY_JNI, "jrt::runtime::native"),
            (LogVerbosity::MONITOR, "jrt::runtime::monitor"),
            (LogVerbosity::STARTUP, "jrt::runtime"),
            (LogVerbosity::THREADS, "jrt::runtime::thread_list"),
            (LogVerbosity::COMPILER, "jrt::runtime::method_registry"),
        ];
        for (flags, target) in targets {
            if self.intersects(flags) {
                directives.push(format!("{target}=debug"));
            }
        }
        directives.join(",")
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct ParsedOptions {
    pub boot_class_path_string: String,
    pub class_path_string: String,
    pub boot_class_path: Option<Vec<Arc<ClassPathArchive>>>,
    pub image: String,
    pub check_jni: bool,
    pub jni_trace: String,
    pub is_compiler: bool,
    pub is_zygote: bool,
    pub interpreter_only: bool,
    pub is_concurrent_gc_enabled: bool,
    pub heap_initial_size: usize,
    pub heap_maximum_size: usize,
    /// 0 means the maximum size.
    pub heap_growth_limit: usize,
    pub heap_min_free: usize,
    pub heap_max_free: usize,
    pub heap_target_utilization: f64,
    pub parallel_gc_threads: usize,
    pub low_memory_mode: bool,
    /// 0 means the platform default.
    pub stack_size: usize,
    pub lock_profiling_threshold: u32,
    pub stack_trace_file: String,
    pub method_trace: bool,
    pub method_trace_file: String,
    pub method_trace_file_size: usize,
    pub small_mode: bool,
    pub small_mode_method_threshold: usize,
    pub small_mode_method_dex_size_limit: usize,
    pub sea_ir_mode: bool,
    pub properties: Vec<String>,
    pub verbose: LogVerbosity,
    pub host_prefix: String,
    pub hooks: Option<Arc<dyn RuntimeHooks>>,
}

impl Default for ParsedOptions {
    fn default() -> Self {
        let processors = thread::available_parallelism().map_or(1, |n| n.get());
        ParsedOptions {
            boot_class_path_string: String::new(),
            class_path_string: String::new(),
            boot_class_path: None,
            image: String::new(),
            check_jni: false,
            jni_trace: String::new(),
            is_compiler: false,
            is_zygote: false,
            interpreter_only: false,
            is_concurrent_gc_enabled: true,
            heap_initial_size: 2 * MB,
            heap_maximum_size: 32 * MB,
            heap_growth_limit: 0,
            heap_min_free: 512 * KB,
            heap_max_free: 2 * MB,
            heap_target_utilization: 0.5,
            parallel_gc_threads: processors.saturating_sub(1),
            low_memory_mode: false,
            stack_size: 0,
            lock_profiling_threshold: 0,
            stack_trace_file: String::new(),
            method_trace: false,
            method_trace_file: "/data/method-trace-file.bin".to_string(),
            method_trace_file_size: 10 * MB,
            small_mode: false,
            small_mode_method_threshold: 10,
            small_mode_method_dex_size_limit: 300,
            sea_ir_mode: false,
            properties: vec![],
            verbose: LogVerbosity::empty(),
            host_prefix: String::new(),
            hooks: None,
        }
    }
}

// accepted for compatibility and otherwise ignored
const IGNORED_OPTIONS: &[&str] = &[
    "-ea",
    "-da",
    "-enableassertions",
    "-disableassertions",
    "-esa",
    "-dsa",
    "-enablesystemassertions",
    "-disablesystemassertions",
    "-Xverify:",
    "-Xrs",
    "-Xint:",
    "-Xdexopt:",
    "-Xnoquithandler",
    "-Xjniopts:",
    "-Xjnigreflimit:",
    "-Xgenregmap",
    "-Xnogenregmap",
    "-Xverifyopt:",
    "-Xcheckdexsum",
    "-Xincludeselectedop",
    "-Xjitop:",
    "-Xincludeselectedmethod",
    "-Xjitthreshold:",
    "-Xjitcodecachesize:",
    "-Xjitblocking",
    "-Xjitmethod:",
    "-Xjitclass:",
    "-Xjitoffset:",
    "-Xjitconfig:",
    "-Xjitcheckcg",
    "-Xjitverbose",
    "-Xjitprofile",
    "-Xjitdisableopt",
    "-Xjitsuspendpoll",
    "-XX:mainThreadStackSize=",
];

impl ParsedOptions {
    pub fn parse(options: &[RuntimeOption], ignore_unrecognized: bool) -> Result<ParsedOptions, ConfigError> {
        let mut parsed = ParsedOptions::default();
        if let Ok(boot_class_path) = env::var("BOOTCLASSPATH") {
            parsed.boot_class_path_string = boot_class_path;
        }
        if let Ok(class_path) = env::var("CLASSPATH") {
            parsed.class_path_string = class_path;
        }

        let mut options = options.iter();
        while let Some(option) = options.next() {
            match option {
                RuntimeOption::BootClassPath(archives) if archives.is_empty() => {
                    if !ignore_unrecognized {
                        return Err(ConfigError::EmptyBootClassPath);
                    }
                    debug!("ignoring empty boot class path option");
                }
                RuntimeOption::BootClassPath(archives) => parsed.boot_class_path = Some(archives.clone()),
                RuntimeOption::HostPrefix(prefix) => parsed.host_prefix = prefix.clone(),
                RuntimeOption::Hooks(hooks) => parsed.hooks = Some(Arc::clone(hooks)),
                RuntimeOption::Arg(arg) if arg == "-classpath" || arg == "-cp" => match options.next() {
                    Some(RuntimeOption::Arg(value)) => parsed.class_path_string = value.clone(),
                    _ => return Err(ConfigError::MissingValue(arg.clone())),
                },
                RuntimeOption::Arg(arg) => parsed.parse_arg(arg, ignore_unrecognized)?,
            }
        }

        if parsed.heap_initial_size > parsed.heap_maximum_size {
            return Err(ConfigError::InconsistentHeapSizes {
                initial: parsed.heap_initial_size,
                maximum: parsed.heap_maximum_size,
            });
        }
        Ok(parsed)
    }

    fn parse_arg(&mut self, option: &str, ignore_unrecognized: bool) -> Result<(), ConfigError> {
        if let Some(value) = option.strip_prefix("-Xbootclasspath:") {
            self.boot_class_path_string = value.to_string();
        } else if let Some(value) = option.strip_prefix("-Ximage:") {
            self.image = value.to_string();
        } else if option == "-Xcheck:jni" {
            self.check_jni = true;
        } else if let Some(value) = option.strip_prefix("-Xms") {
            self.heap_initial_size = memory_option(option, value, KB)?;
        } else if let Some(value) = option.strip_prefix("-Xmx") {
            self.heap_maximum_size = memory_option(option, value, KB)?;
        } else if let Some(value) = option.strip_prefix("-XX:HeapGrowthLimit=") {
            self.heap_growth_limit = memory_option(option, value, KB)?;
        } else if let Some(value) = option.strip_prefix("-XX:HeapMinFree=") {
            self.heap_min_free = memory_option(option, value, KB)?;
        } else if let Some(value) = option.strip_prefix("-XX:HeapMaxFree=") {
            self.heap_max_free = memory_option(option, value, KB)?;
        } else if let Some(value) = option.strip_prefix("-XX:HeapTargetUtilization=") {
            self.heap_target_utilization = value
                .parse::<f64>()
                .ok()
                .filter(|utilization| (0.1..=0.9).contains(utilization))
                .ok_or_else(|| ConfigError::invalid(option, value))?;
        } else if let Some(value) = option.strip_prefix("-XX:ParallelGCThreads=") {
            self.parallel_gc_threads = integer_option(option, value)?;
        } else if let Some(value) = option.strip_prefix("-Xss") {
            self.stack_size = memory_option(option, value, 1)?;
        } else if option == "-XX:LowMemoryMode" {
            self.low_memory_mode = true;
        } else if let Some(value) = option.strip_prefix("-Xgc:") {
            for gc_option in value.split(',') {
                match gc_option {
                    "concurrent" => self.is_concurrent_gc_enabled = true,
                    "noconcurrent" => self.is_concurrent_gc_enabled = false,
                    _ => return Err(ConfigError::invalid(option, gc_option)),
                }
            }
        } else if let Some(value) = option.strip_prefix("-verbose:") {
            let verbose = LogVerbosity::parse_tags(value).ok_or_else(|| ConfigError::invalid(option, value))?;
            self.verbose |= verbose;
        } else if let Some(value) = option.strip_prefix("-Xjnitrace:") {
            self.jni_trace = value.to_string();
        } else if let Some(property) = option.strip_prefix("-D") {
            self.properties.push(property.to_string());
        } else if option == "-Xzygote" {
            self.is_zygote = true;
        } else if option == "-Xint" {
            self.interpreter_only = true;
        } else if option == "compiler" {
            self.is_compiler = true;
        } else if let Some(value) = option.strip_prefix("-Xlockprofthreshold:") {
            self.lock_profiling_threshold = value.parse().map_err(|_| ConfigError::invalid(option, value))?;
        } else if let Some(value) = option.strip_prefix("-Xstacktracefile:") {
            self.stack_trace_file = value.to_string();
        } else if option == "-Xmethod-trace" {
            self.method_trace = true;
        } else if let Some(value) = option.strip_prefix("-Xmethod-trace-file:") {
            self.method_trace_file = value.to_string();
        } else if let Some(value) = option.strip_prefix("-Xmethod-trace-file-size:") {
            self.method_trace_file_size = integer_option(option, value)?;
        } else if option == "-small" {
            self.small_mode = true;
        } else if option == "-Xsea_ir" {
            self.sea_ir_mode = true;
        } else if IGNORED_OPTIONS.iter().any(|ignored| option.starts_with(ignored)) {
            debug!(option, "ignoring legacy option");
        } else if !ignore_unrecognized {
            return Err(ConfigError::UnrecognizedOption(option.to_string()));
        } else {
            debug!(option, "ignoring unrecognized option");
        }
        Ok(())
    }
}

fn integer_option<T: std::str::FromStr>(option: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::invalid(option, value))
}

fn memory_option(option: &str, value: &str, div: usize) -> Result<usize, ConfigError> {
    parse_memory_option(value, div).ok_or_else(|| ConfigError::invalid(option, value))
}

fn memory_size(input: &str) -> IResult<&str, (usize, Option<char>)> {
    all_consuming((
        map_res(digit1, |digits: &str| digits.parse::<usize>()),
        opt(one_of("kKmMgG")),
    ))
    .parse(input)
}

/// Parses a size such as `16m` into bytes. Returns `None` for malformed
/// input, zero, or a size that is not a multiple of `div`. Sizes that
/// overflow clamp to the largest multiple of 1024.
pub fn parse_memory_option(input: &str, div: usize) -> Option<usize> {
    let (_, (value, unit)) = memory_size(input).ok()?;
    let multiplier = match unit {
        None => 1,
        Some('k' | 'K') => KB,
        Some('m' | 'M') => MB,
        Some(_) => GB,
    };
    let bytes = value.checked_mul(multiplier).unwrap_or(usize::MAX & !(KB - 1));
    (bytes != 0 && bytes % div == 0).then_some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(args: &[&str]) -> Vec<RuntimeOption> {
        args.iter().copied().map(RuntimeOption::from).collect()
    }

    #[test]
    fn test_parse_memory_option() {
        assert_eq!(parse_memory_option("16m", KB), Some(16 * MB));
        assert_eq!(parse_memory_option("2048", KB), Some(2048));
        assert_eq!(parse_memory_option("3K", 1), Some(3 * KB));
        assert_eq!(parse_memory_option("1g", KB), Some(GB));
        assert_eq!(parse_memory_option("1000", KB), None);
        assert_eq!(parse_memory_option("0", 1), None);
        assert_eq!(parse_memory_option("", 1), None);
        assert_eq!(parse_memory_option("12q", 1), None);
        assert_eq!(parse_memory_option("m", 1), None);
        assert_eq!(parse_memory_option("-4k", 1), None);
        assert_eq!(
            parse_memory_option(&format!("{}g", usize::MAX), KB),
            Some(usize::MAX & !(KB - 1))
        );
    }

    #[test]
    fn test_parse_heap_and_gc_options() {
        let parsed = ParsedOptions::parse(
            &args(&["-Xms4m", "-Xmx64m", "-XX:HeapGrowthLimit=48m", "-Xgc:noconcurrent", "-Xss256k"]),
            false,
        )
        .unwrap();
        assert_eq!(parsed.heap_initial_size, 4 * MB);
        assert_eq!(parsed.heap_maximum_size, 64 * MB);
        assert_eq!(parsed.heap_growth_limit, 48 * MB);
        assert!(!parsed.is_concurrent_gc_enabled);
        assert_eq!(parsed.stack_size, 256 * KB);
    }

    #[test]
    fn test_classpath_takes_next_argument() {
        let parsed = ParsedOptions::parse(&args(&["-cp", "/app.jar", "-Xzygote"]), false).unwrap();
        assert_eq!(parsed.class_path_string, "/app.jar");
        assert!(parsed.is_zygote);

        let err = ParsedOptions::parse(&args(&["-classpath"]), false).unwrap_err();
        assert_eq!(err, ConfigError::MissingValue("-classpath".to_string()));
    }

    #[test]
    fn test_unrecognized_options() {
        let err = ParsedOptions::parse(&args(&["-Xbogus"]), false).unwrap_err();
        assert_eq!(err, ConfigError::UnrecognizedOption("-Xbogus".to_string()));
        assert!(ParsedOptions::parse(&args(&["-Xbogus"]), true).is_ok());
        assert!(ParsedOptions::parse(&args(&["-Xjitthreshold:40", "-ea"]), false).is_ok());
    }

    #[test]
    fn test_empty_boot_class_path() {
        let options = vec![RuntimeOption::BootClassPath(vec![])];
        assert_eq!(
            ParsedOptions::parse(&options, false).unwrap_err(),
            ConfigError::EmptyBootClassPath
        );
        let parsed = ParsedOptions::parse(&options, true).unwrap();
        assert!(parsed.boot_class_path.is_none());
    }

    #[test]
    fn test_inconsistent_heap_sizes() {
        let err = ParsedOptions::parse(&args(&["-Xms64m", "-Xmx16m"]), false).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InconsistentHeapSizes {
                initial: 64 * MB,
                maximum: 16 * MB
            }
        );
    }

    #[test]
    fn test_invalid_values() {
        for bad in ["-Xmx1000", "-XX:HeapTargetUtilization=0.95", "-Xgc:precise", "-verbose:gc,nope"] {
            let err = ParsedOptions::parse(&args(&[bad]), true).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { .. }), "{bad}: {err:?}");
        }
    }

    #[test]
    fn test_verbose_and_properties() {
        let parsed = ParsedOptions::parse(
            &args(&["-verbose:gc,threads", "-verbose:class", "-Dfoo=bar", "-small", "compiler"]),
            false,
        )
        .unwrap();
        assert_eq!(
            parsed.verbose,
            LogVerbosity::GC | LogVerbosity::THREADS | LogVerbosity::CLASS_LINKER
        );
        assert_eq!(parsed.properties, vec!["foo=bar".to_string()]);
        assert!(parsed.small_mode);
        assert!(parsed.is_compiler);

        let directives = parsed.verbose.env_filter_directives();
        assert!(directives.contains("jrt::runtime::heap=debug"));
        assert!(directives.contains("jrt::runtime::thread_list=debug"));
        assert!(!directives.contains("jrt::runtime::monitor"));
    }
}
