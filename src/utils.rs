use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn random_bytes<R, const N: usize>(rng: &mut R) -> [u8; N]
where
    R: RngCore + CryptoRng,
{
    let mut bytes = [0; N];
    rng.fill_bytes(&mut bytes);
    bytes
}

/// Writes `data` to `path` through a temporary file in the same directory,
/// then renames it into place. Readers never observe a partial file.
pub fn write_atomically(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "veilfs".to_string())
    ));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Nanosecond timestamp as stored in directory entries and blob headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timespec {
    pub secs: i64,
    pub nanos: u32,
}

impl Timespec {
    pub const ZERO: Timespec = Timespec { secs: 0, nanos: 0 };

    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Timespec {
                secs: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            // Clock before 1970. Clamp instead of panicking.
            Err(_) => Timespec::ZERO,
        }
    }
}
