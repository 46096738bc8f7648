// Time bases
/// Any splitter time at or below this many seconds is relative to the run start
pub const FIFTEEN_YEARS_IN_SECONDS: f64 = 15.0 * 365.0 * 24.0 * 3600.0;
/// Boundary tolerance used when comparing segment edges
pub const SPLITTER_TOLERANCE: f64 = 1.0e-10;
/// Decimal digits used for times in splitter files
pub const SPLITTER_TIME_PRECISION: usize = 9;

// GSAS layout
pub const GSAS_LINE_WIDTH: usize = 80;
pub const GSAS_FIELD_WIDTH: usize = 12;
pub const GSAS_EXTENSION: &str = "gda";
pub const GSAS_BINNED_BY: &str = "Mantid";
pub const DEFAULT_IPARM_FILE: &str = "vulcan.prm";

// Pipeline defaults
pub const DEFAULT_POOL_SIZE: usize = 24;
pub const DEFAULT_MEMORY_CEILING: usize = 200;
pub const DEFAULT_FILE_INDEX_START: usize = 1;
pub const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 3600;
pub const JOIN_POLL_MILLIS: u64 = 20;

// Lookup file
pub const LOOKUP_SUFFIX: &str = "chop_info.txt";
pub const LOOKUP_NONE: &str = "None";

// Event file
pub const EVENT_FILE_MAGIC: &[u8; 4] = b"VEVT";
pub const EVENT_FILE_VERSION: u32 = 1;
