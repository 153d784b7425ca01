//! Machine and kernel configuration.
//!
//! The configuration file is line-oriented text: `key = value` pairs, `#`
//! starts a comment line, blank lines are ignored. Every recognized option
//! has a default; an unrecognized key aborts the load with the offending
//! file, line number and content.

use std::fmt;
use std::path::Path;

/// Working mode of the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AciaMode {
    /// Device absent; the Tty system calls fail.
    #[default]
    None,
    /// Driver polls the device state registers.
    BusyWaiting,
    /// Driver sleeps on semaphores signaled by device interrupts.
    Interrupt,
}

/// A `FileToCopy` directive: copy a host file into the simulated file
/// system at startup.
#[derive(Debug, Clone)]
pub struct CopyDirective {
    pub host_path: String,
    pub guest_path: String,
}

/// Maximum number of `FileToCopy` directives in one configuration file.
pub const MAX_FILE_COPIES: usize = 100;

/// The configuration record. Field names follow the option names of the
/// configuration file.
#[derive(Debug, Clone)]
pub struct Config {
    pub processor_frequency: u32,
    pub num_phys_pages: u64,
    pub max_virt_pages: u64,
    pub sector_size: usize,
    pub page_size: usize,
    pub user_stack_size: usize,
    pub max_file_name_size: usize,
    pub num_dir_entries: usize,
    pub target_machine_name: String,
    pub program_to_run: String,
    pub print_stat: bool,
    pub format_disk: bool,
    pub list_dir: bool,
    pub print_file_syst: bool,
    pub files_to_copy: Vec<CopyDirective>,
    pub file_to_print: Option<String>,
    pub file_to_remove: Option<String>,
    pub dir_to_make: Option<String>,
    pub dir_to_remove: Option<String>,
    pub acia: AciaMode,
    pub num_port_loc: u32,
    pub num_port_dist: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            processor_frequency: 100,
            num_phys_pages: 20,
            max_virt_pages: 1024,
            sector_size: 128,
            page_size: 128,
            user_stack_size: 8 * 1024,
            max_file_name_size: 256,
            num_dir_entries: 10,
            target_machine_name: String::new(),
            program_to_run: String::new(),
            print_stat: false,
            format_disk: false,
            list_dir: false,
            print_file_syst: false,
            files_to_copy: Vec::new(),
            file_to_print: None,
            file_to_remove: None,
            dir_to_make: None,
            dir_to_remove: None,
            acia: AciaMode::None,
            num_port_loc: 32009,
            num_port_dist: 32009,
        }
    }
}

/// A configuration file could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't open configuration file {0}")]
    Io(String),
    #[error("config error: file {file} line {line} ---> \"{content}\"")]
    Parse {
        file: String,
        line: usize,
        content: String,
    },
    #[error("configuration error: {0}")]
    Invalid(String),
}

fn power_of_two(size: usize) -> bool {
    size != 0 && (size & (size - 1)) == 0
}

impl Config {
    /// Number of direct block pointers a file header can hold.
    pub fn num_direct(&self) -> usize {
        (self.sector_size - 4 * std::mem::size_of::<u32>()) / std::mem::size_of::<u32>()
    }

    /// Largest representable file, in bytes.
    pub fn max_file_size(&self) -> usize {
        self.num_direct() * self.sector_size
    }

    /// Load a configuration file on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::Io(path.display().to_string()))?;
        let mut cfg = Config::default();
        let fail = |line: usize, content: &str| ConfigError::Parse {
            file: path.display().to_string(),
            line,
            content: content.trim_end().to_string(),
        };

        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => return Err(fail(lineno, raw)),
            };
            let parse_u32 = |v: &str| v.parse::<u32>().map_err(|_| fail(lineno, raw));
            let parse_u64 = |v: &str| v.parse::<u64>().map_err(|_| fail(lineno, raw));
            let parse_usize = |v: &str| v.parse::<usize>().map_err(|_| fail(lineno, raw));
            let parse_bool = |v: &str| match v.parse::<u32>() {
                Ok(n) => Ok(n != 0),
                Err(_) => Err(fail(lineno, raw)),
            };
            match key {
                "ProcessorFrequency" => cfg.processor_frequency = parse_u32(value)?,
                "NumPhysPages" => cfg.num_phys_pages = parse_u64(value)?,
                "MaxVirtPages" => cfg.max_virt_pages = parse_u64(value)?,
                "SectorSize" => cfg.sector_size = parse_usize(value)?,
                "PageSize" => cfg.page_size = parse_usize(value)?,
                "UserStackSize" => cfg.user_stack_size = parse_usize(value)?,
                "MaxFileNameSize" => cfg.max_file_name_size = parse_usize(value)?,
                "NumDirEntries" => cfg.num_dir_entries = parse_usize(value)?,
                "TargetMachineName" => cfg.target_machine_name = value.to_string(),
                "ProgramToRun" => cfg.program_to_run = value.to_string(),
                "PrintStat" => cfg.print_stat = parse_bool(value)?,
                "FormatDisk" => cfg.format_disk = parse_bool(value)?,
                "ListDir" => cfg.list_dir = parse_bool(value)?,
                "PrintFileSyst" => cfg.print_file_syst = parse_bool(value)?,
                "FileToCopy" => {
                    let mut parts = value.split_whitespace();
                    match (parts.next(), parts.next(), parts.next()) {
                        (Some(host), Some(guest), None) => {
                            if cfg.files_to_copy.len() >= MAX_FILE_COPIES {
                                return Err(fail(lineno, raw));
                            }
                            cfg.files_to_copy.push(CopyDirective {
                                host_path: host.to_string(),
                                guest_path: guest.to_string(),
                            });
                        }
                        _ => return Err(fail(lineno, raw)),
                    }
                }
                "FileToPrint" => cfg.file_to_print = Some(value.to_string()),
                "FileToRemove" => cfg.file_to_remove = Some(value.to_string()),
                "DirToMake" => cfg.dir_to_make = Some(value.to_string()),
                "DirToRemove" => cfg.dir_to_remove = Some(value.to_string()),
                "UseACIA" => {
                    cfg.acia = match value {
                        "None" => AciaMode::None,
                        "BusyWaiting" => AciaMode::BusyWaiting,
                        "Interrupt" => AciaMode::Interrupt,
                        _ => return Err(fail(lineno, raw)),
                    }
                }
                "NumPortLoc" => cfg.num_port_loc = parse_u32(value)?,
                "NumPortDist" => cfg.num_port_dist = parse_u32(value)?,
                _ => return Err(fail(lineno, raw)),
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Enforce the cross-option constraints. Also applied to hand-built
    /// configurations.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.page_size != self.sector_size {
            log::warn!(
                "PageSize<>SectorSize, setting both to {}",
                self.sector_size
            );
            self.page_size = self.sector_size;
        }
        if !power_of_two(self.sector_size) {
            return Err(ConfigError::Invalid(
                "SectorSize should be a power of two".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "machine: {} pages of {} bytes, disk sectors of {} bytes",
            self.num_phys_pages, self.page_size, self.sector_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_cfg(content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "rvos-cfg-{}-{:?}.cfg",
            std::process::id(),
            std::thread::current().id()
        ));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_recognized_options() {
        let path = write_cfg(
            "# comment\n\
             NumPhysPages = 4\n\
             FormatDisk = 1\n\
             ProgramToRun = sort\n\
             FileToCopy = host.bin /g\n\
             UseACIA = Interrupt\n",
        );
        let cfg = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(cfg.num_phys_pages, 4);
        assert!(cfg.format_disk);
        assert_eq!(cfg.program_to_run, "sort");
        assert_eq!(cfg.files_to_copy.len(), 1);
        assert_eq!(cfg.files_to_copy[0].guest_path, "/g");
        assert_eq!(cfg.acia, AciaMode::Interrupt);
    }

    #[test]
    fn unknown_key_reports_line() {
        let path = write_cfg("NumPhysPages = 4\nBogusOption = 12\n");
        let err = Config::from_file(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        match err {
            ConfigError::Parse { line, content, .. } => {
                assert_eq!(line, 2);
                assert!(content.contains("BogusOption"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn page_size_coerced_to_sector_size() {
        let path = write_cfg("SectorSize = 256\nPageSize = 128\n");
        let cfg = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(cfg.page_size, 256);
        assert_eq!(cfg.num_direct(), (256 - 16) / 4);
    }

    #[test]
    fn rejects_non_power_of_two_sectors() {
        let path = write_cfg("SectorSize = 100\nPageSize = 100\n");
        assert!(Config::from_file(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
