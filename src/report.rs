//! Plain-text run reports: where they go and the run log itself.

use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Header of a run log file.
pub const RUNLOG_HEADER: &str = "## run.log\n# information regarding this run\n\n";

/// Where a report is written. Files get a comment header, standard output
/// does not.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Destination {
    #[default]
    Stdout,
    File(PathBuf),
}

impl Destination {
    pub fn file(path: impl AsRef<Path>) -> Self {
        Destination::File(path.as_ref().to_path_buf())
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Destination::File(_))
    }

    /// Path for error messages.
    pub fn path_or_stdout(&self) -> PathBuf {
        match self {
            Destination::Stdout => PathBuf::from("<stdout>"),
            Destination::File(path) => path.clone(),
        }
    }

    /// Opens the destination for writing; a file is truncated and starts with
    /// `header`.
    pub fn open(&self, header: &str) -> io::Result<Box<dyn Write>> {
        match self {
            Destination::Stdout => Ok(Box::new(io::stdout())),
            Destination::File(path) => {
                let mut writer = BufWriter::new(File::create(path)?);
                writer.write_all(header.as_bytes())?;
                Ok(Box::new(writer))
            }
        }
    }
}

/// Formats a duration as `H:MM:SS`, with microseconds appended when non-zero.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs / 60) % 60, secs % 60);
    let micros = elapsed.subsec_micros();
    if micros == 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours}:{minutes:02}:{seconds:02}.{micros:06}")
    }
}

/// Version string recorded in run logs. Unreleased builds (`0.0.0`) are marked
/// as development builds with their date.
pub fn program_version(now: DateTime<Utc>) -> String {
    match env!("CARGO_PKG_VERSION") {
        "0.0.0" => format!("dev on {} (UTC)", now.format("%Y-%m-%dT%H:%M:%SZ")),
        version => version.to_string(),
    }
}

/// Writes the run log: program version, elapsed time and finish date.
pub fn runlog(elapsed: Duration, destination: &Destination) -> io::Result<()> {
    runlog_at(elapsed, Utc::now(), destination)
}

pub fn runlog_at(elapsed: Duration, finished: DateTime<Utc>, destination: &Destination) -> io::Result<()> {
    let mut out = destination.open(RUNLOG_HEADER)?;
    writeln!(out, "# program version")?;
    writeln!(out, "{}\n", program_version(finished))?;
    writeln!(out, "# execution time in the format hours:minutes:seconds")?;
    writeln!(out, "{}\n", format_elapsed(elapsed))?;
    writeln!(out, "# finish date")?;
    writeln!(out, "{}", finished.format("%Y-%m-%d %H:%M:%S UTC"))?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn elapsed_time_format() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_elapsed(Duration::from_secs(3 * 3600 + 7 * 60 + 9)), "3:07:09");
        assert_eq!(format_elapsed(Duration::from_millis(61_500)), "0:01:01.500000");
        assert_eq!(format_elapsed(Duration::from_secs(30 * 3600)), "30:00:00");
    }

    #[test]
    fn runlog_file_has_header_and_sections() {
        let dir = tempdir().expect("Could not create temp dir");
        let path = dir.path().join("run.log");
        let finished = Utc.with_ymd_and_hms(2024, 5, 17, 13, 4, 5).unwrap();

        runlog_at(Duration::from_secs(75), finished, &Destination::file(&path)).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let expected = format!(
            "{RUNLOG_HEADER}# program version\n{}\n\n\
             # execution time in the format hours:minutes:seconds\n0:01:15\n\n\
             # finish date\n2024-05-17 13:04:05 UTC\n",
            env!("CARGO_PKG_VERSION")
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn destinations() {
        assert!(!Destination::default().is_file());
        assert_eq!(Destination::Stdout.path_or_stdout(), PathBuf::from("<stdout>"));
        assert!(Destination::file("x.log").is_file());
    }
}
