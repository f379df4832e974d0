// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Polling file tailer.
//!
//! Every interval the watcher walks its root directory, and for each matching file reads the
//! bytes appended since the previous poll. Complete lines are sent over a channel tagged with the
//! file's path; a trailing line without newline waits until it's completed.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub root: PathBuf,
    /// Shell style globs (`*`, `?`) matched against the full path. Empty matches every file.
    pub patterns: Vec<String>,
    pub ignore: Vec<String>,
    pub case_sensitive: bool,
    pub interval: Duration,
}

impl WatcherConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            patterns: Vec::new(),
            ignore: Vec::new(),
            case_sensitive: true,
            interval: DEFAULT_INTERVAL,
        }
    }
}

pub struct FileWatcher {
    root: PathBuf,
    patterns: Vec<Regex>,
    ignore: Vec<Regex>,
    interval: Duration,
    offsets: HashMap<PathBuf, u64>,
    tx: mpsc::Sender<(PathBuf, String)>,
}

impl FileWatcher {
    /// Creates the watcher and remembers the current size of every matching file, so only
    /// content written from now on is delivered.
    pub async fn new(
        config: WatcherConfig,
        tx: mpsc::Sender<(PathBuf, String)>,
    ) -> Result<Self, regex::Error> {
        let compile = |globs: &[String]| {
            globs
                .iter()
                .map(|glob| glob_to_regex(glob, config.case_sensitive))
                .collect::<Result<Vec<_>, _>>()
        };

        let mut watcher = Self {
            patterns: compile(&config.patterns)?,
            ignore: compile(&config.ignore)?,
            root: config.root,
            interval: config.interval,
            offsets: HashMap::new(),
            tx,
        };

        match watcher.scan().await {
            Ok(files) => {
                for path in files {
                    if let Ok(metadata) = fs::metadata(&path).await {
                        watcher.offsets.insert(path, metadata.len());
                    }
                }
            }
            Err(e) => error!("Failed to scan {}: {}", watcher.root.display(), e),
        }
        debug!(
            "Watching {} files under {}",
            watcher.offsets.len(),
            watcher.root.display()
        );

        Ok(watcher)
    }

    fn matches(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        let included =
            self.patterns.is_empty() || self.patterns.iter().any(|re| re.is_match(&path));
        included && !self.ignore.iter().any(|re| re.is_match(&path))
    }

    /// Lists matching regular files under the root. Symbolic links aren't followed.
    async fn scan(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if dir == self.root => return Err(e),
                Err(e) => {
                    debug!("Skipping {}: {}", dir.display(), e);
                    continue;
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() && self.matches(&path) {
                    files.push(path);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Reads new content of all matching files. Returns the number of lines delivered, or
    /// `None` when the receiving side is gone.
    pub async fn poll(&mut self) -> io::Result<Option<usize>> {
        let files = self.scan().await?;
        self.offsets.retain(|path, _| files.binary_search(path).is_ok());

        let mut delivered = 0;
        for path in files {
            let size = match fs::metadata(&path).await {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    debug!("Failed to stat {}: {}", path.display(), e);
                    continue;
                }
            };

            let offset = self.offsets.get(&path).copied().unwrap_or(0);
            if size < offset {
                debug!("{} was truncated", path.display());
                self.offsets.insert(path, size);
                continue;
            }
            if size == offset {
                continue;
            }

            let (lines, consumed) = match read_lines(&path, offset).await {
                Ok(read) => read,
                Err(e) => {
                    debug!("Failed to read {}: {}", path.display(), e);
                    continue;
                }
            };
            self.offsets.insert(path.clone(), offset + consumed);

            for line in lines {
                trace!("New line in {}", path.display());
                if self.tx.send((path.clone(), line)).await.is_err() {
                    return Ok(None);
                }
                delivered += 1;
            }
        }

        Ok(Some(delivered))
    }

    /// Polls every interval until `cancel` fires or the receiver is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }

            match self.poll().await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => error!("Failed to watch {}: {}", self.root.display(), e),
            }
        }
        debug!("Stopped watching {}", self.root.display());
    }
}

/// Reads complete lines starting at `offset`. Returns the non-blank lines and the number of
/// bytes consumed, which excludes an unterminated last line.
async fn read_lines(path: &Path, offset: u64) -> io::Result<(Vec<String>, u64)> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;

    let Some(end) = buf.iter().rposition(|b| *b == b'\n') else {
        return Ok((Vec::new(), 0));
    };

    let lines = buf[..end]
        .split(|b| *b == b'\n')
        .map(|line| String::from_utf8_lossy(line).trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    Ok((lines, end as u64 + 1))
}

fn glob_to_regex(glob: &str, case_sensitive: bool) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() * 2 + 2);
    pattern.push('^');
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            c => pattern.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    pattern.push('$');

    RegexBuilder::new(&pattern)
        .case_insensitive(!case_sensitive)
        .build()
}
