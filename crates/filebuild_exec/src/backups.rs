//! Backups of files that a build may need to restore.

use log::{error, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

/**
 * Provides the ability to back up files.
 *
 * Backups are stored in a private temporary directory. Dropping the
 * `FileBackups` removes that directory, whether or not the backups were
 * restored. `FileBackups` is thread-safe.
 */
pub struct FileBackups {
    temp_dir: TempDir,
    state: Mutex<BackupState>,
}

#[derive(Default)]
struct BackupState {
    /**
     * The backup files, in recording order. Each pair consists of the
     * filename of the file we backed up and the location where we're storing
     * its backup.
     */
    backups: Vec<(String, PathBuf)>,

    /**
     * An integer identifying the next backup we will attempt; used to select
     * a filename to store the backup
     */
    next_backup_index: u64,
}

impl FileBackups {
    pub fn new() -> io::Result<FileBackups> {
        let temp_dir = tempfile::Builder::new().prefix("filebuild_").tempdir()?;
        Ok(FileBackups {
            temp_dir,
            state: Mutex::new(BackupState::default()),
        })
    }

    /**
     * Back up the specified file and remove it from its current location.
     *
     * If the file does not exist, this has no effect. (This may happen
     * during builds that use multithreading.) If the filename refers to a
     * directory, this may remove the directory. That is not normally
     * desirable, but it might be an acceptable cost as a way to deal with
     * external modifications to the file system.
     *
     * Returns whether the file existed and was a regular file.
     */
    pub fn back_up_and_remove(&self, filename: &str) -> io::Result<bool> {
        let mut value = {
            let mut state = self.state.lock().unwrap();
            let index = state.next_backup_index;
            state.next_backup_index += 1;
            index
        };

        // Store the backup files in subdirectories so that each directory
        // has at most 128 files and 128 directories. This prevents us from
        // having one directory with a ton of files, which may reduce
        // performance.
        let mut backup_dir = self.temp_dir.path().to_path_buf();
        while value >= 128 {
            backup_dir.push(format!("{:02x}", value % 128));
            value /= 128;
        }
        let backup_filename = backup_dir.join(format!("file_{:02x}", value));

        fs::create_dir_all(&backup_dir)?;
        match fs::rename(filename, &backup_filename) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(error) => return Err(error),
        }

        if backup_filename.is_dir() {
            // "filename" was a directory when we backed it up
            return Ok(false);
        }

        self.state
            .lock()
            .unwrap()
            .backups
            .push((filename.to_string(), backup_filename));
        Ok(true)
    }

    /**
     * Restore all files backed up since the last `restore_all` call.
     *
     * Each file is restored to its original location and filename,
     * overwriting any existing regular files. Whenever we are unable to
     * restore a file, we skip the file and move on to the next one.
     */
    pub fn restore_all(&self) {
        let backups = std::mem::take(&mut self.state.lock().unwrap().backups);
        for (filename, backup_filename) in backups {
            let target = Path::new(&filename);
            if target.is_dir() {
                error!(
                    "Unable to restore old contents of {}, because it is an existing \
                     directory",
                    filename,
                );
                continue;
            }

            if let Some(parent) = target.parent() {
                if let Err(err) = fs::create_dir_all(parent) {
                    error!(
                        "Unable to restore old contents of {}, because we failed to \
                         create the parent directories: {}",
                        filename, err,
                    );
                    continue;
                }
            }

            if let Err(err) = replace_file(&backup_filename, target) {
                error!("Failed to restore old contents of {}: {}", filename, err);
                continue;
            }
            info!("Restored old contents of {}", filename);
        }
    }
}

/** Move `from` to `to`, overwriting `to` if it is an existing regular file */
fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) if to.is_file() => {
            fs::remove_file(to)?;
            fs::rename(from, to)
        }
        Err(error) => Err(error),
    }
}
