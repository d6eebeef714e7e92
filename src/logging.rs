//! Logging setup. The teacher printed progress directly to stdout via a
//! `log_if(!quiet, ...)` helper in `main.rs`; here that's replaced by
//! `env_logger` so progress, warnings, and cache-miss notices all flow
//! through the standard `log` facade instead of ad-hoc `println!`/`eprintln!`.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use log::LevelFilter;

/// Duplicates every log line to stderr and to the run's `<out_prefix>.log`
/// file, so a long unattended run still leaves a record on disk even when
/// the console output scrolled away.
struct Tee {
    stderr: io::Stderr,
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        self.stderr.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.stderr.flush()
    }
}

/// Initializes the global logger. `quiet` maps to `Warn` (matching the
/// teacher's `-q/--quiet` flag semantics); otherwise `Info`. When
/// `log_file_path` can be created, every line is also duplicated there;
/// if it can't be (e.g. the output directory doesn't exist), logging falls
/// back to stderr only rather than failing the run over a log file.
pub fn init(quiet: bool, log_file_path: &Path) {
    let level = if quiet { LevelFilter::Warn } else { LevelFilter::Info };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()));

    if let Ok(file) = File::create(log_file_path) {
        builder.target(env_logger::Target::Pipe(Box::new(Tee { stderr: io::stderr(), file })));
    }

    let _ = builder.try_init();
}
