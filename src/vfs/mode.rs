//! Open modes
//!
//! | mode | read | write | truncate | append | create | exclusive |
//! |------|------|-------|----------|--------|--------|-----------|
//! | `r`  | yes  | no    | no       | no     | no     | no        |
//! | `r+` | yes  | yes   | no       | no     | no     | no        |
//! | `w`  | no   | yes   | yes      | no     | yes    | no        |
//! | `w+` | yes  | yes   | yes      | no     | yes    | no        |
//! | `a`  | no   | yes   | no       | yes    | yes    | no        |
//! | `a+` | yes  | yes   | no       | yes    | yes    | no        |
//! | `x`  | no   | yes   | no       | no     | yes    | yes       |
//! | `x+` | yes  | yes   | no       | no     | yes    | yes       |
//! | `c+` | yes  | yes   | no       | no     | yes    | no        |
//!
//! `b` and `t` letters are ignored; `c` is read as `c+`.

use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Interpreted open mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub truncate: bool,
    pub append: bool,
    pub create: bool,
    pub exclusive: bool,
}

impl OpenMode {
    pub const READ: OpenMode = OpenMode {
        read: true,
        write: false,
        truncate: false,
        append: false,
        create: false,
        exclusive: false,
    };

    /// Interpret `open(2)` flags.
    ///
    /// Write-only opens without `O_TRUNC` or `O_APPEND` become read-write:
    /// the host writes at offsets into the existing content, so the
    /// content has to be loaded.
    pub fn from_flags(flags: i32) -> Self {
        let access = flags & libc::O_ACCMODE;
        let truncate = flags & libc::O_TRUNC != 0;
        let append = flags & libc::O_APPEND != 0;
        let create = flags & libc::O_CREAT != 0;

        let write = access == libc::O_WRONLY || access == libc::O_RDWR;
        let read = access != libc::O_WRONLY || !(truncate || append);

        Self {
            read,
            write,
            truncate: write && truncate,
            append: write && append,
            create,
            exclusive: create && flags & libc::O_EXCL != 0,
        }
    }

    /// Whether opening needs the existing body
    pub fn needs_content(&self) -> bool {
        !(self.truncate || self.exclusive)
    }
}

impl FromStr for OpenMode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let letters: String = s.chars().filter(|c| !matches!(c, 'b' | 't')).collect();
        let (base, plus) = match letters.strip_suffix('+') {
            Some(base) => (base, true),
            None => (letters.as_str(), false),
        };

        let mode = match base {
            "r" => OpenMode {
                read: true,
                write: plus,
                ..Default::default()
            },
            "w" => OpenMode {
                read: plus,
                write: true,
                truncate: true,
                create: true,
                ..Default::default()
            },
            "a" => OpenMode {
                read: plus,
                write: true,
                append: true,
                create: true,
                ..Default::default()
            },
            "x" => OpenMode {
                read: plus,
                write: true,
                create: true,
                exclusive: true,
                ..Default::default()
            },
            "c" => OpenMode {
                read: true,
                write: true,
                create: true,
                ..Default::default()
            },
            _ => {
                return Err(StoreError::InvalidArgument(format!(
                    "Unknown open mode: {:?}",
                    s
                )))
            }
        };
        Ok(mode)
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = if self.exclusive {
            "x"
        } else if self.append {
            "a"
        } else if self.truncate {
            "w"
        } else if self.create {
            "c"
        } else {
            "r"
        };
        let plus = if base == "c" || (base == "r" && self.write) || (base != "r" && self.read) {
            "+"
        } else {
            ""
        };
        write!(f, "{}{}", base, plus)
    }
}
