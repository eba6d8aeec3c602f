//! KV engine
//!
//! Text command grammar over the store: `PUT key value`, `GET key`,
//! `SZOF key`, `NNZ key`. Replies are text; failures are ordinary
//! `ERR: ...` strings, never transport errors.
//!
//! The store is writeable only while the seed command file replays,
//! before any worker launches. After that it freezes read-only and is
//! shared across store workers without locks; a runtime `PUT` answers
//! `ERR: Not writeable`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::warn;

const PUT_PREFIX: &str = "PUT ";
const GET_PREFIX: &str = "GET ";
const SZOF_PREFIX: &str = "SZOF ";
const NNZ_PREFIX: &str = "NNZ ";

#[derive(Debug)]
pub struct KvStore {
    map: HashMap<String, String>,
    writeable: bool,
    readable: bool,
}

impl KvStore {
    /// Replay the seed file, then freeze. A missing or unreadable file
    /// leaves an empty store and a warning.
    pub fn load(path: Option<&Path>) -> Self {
        let mut store = Self {
            map: HashMap::new(),
            writeable: true,
            readable: false,
        };
        if let Some(path) = path {
            match File::open(path) {
                Ok(file) => {
                    for line in BufReader::new(file).lines() {
                        let line = match line {
                            Ok(line) => line,
                            Err(e) => {
                                warn!("stopped reading seed file {}: {e}", path.display());
                                break;
                            }
                        };
                        if line.is_empty() {
                            continue;
                        }
                        let reply = store.apply(&line);
                        if reply.starts_with("ERR") {
                            warn!("could not process seed line {line:?}: {reply}");
                        }
                    }
                }
                Err(e) => warn!("could not open seed file {}: {e}", path.display()),
            }
        }
        store.writeable = false;
        store.readable = true;
        store
    }

    /// Number of seeded entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Serve one request against the frozen store.
    pub fn process(&self, req: &str) -> String {
        if req.starts_with(PUT_PREFIX) {
            return "ERR: Not writeable".to_string();
        }
        if let Some(rest) = req.strip_prefix(GET_PREFIX) {
            return self.get_reply(rest);
        }
        if let Some(rest) = req.strip_prefix(SZOF_PREFIX) {
            return self.szof_reply(rest);
        }
        if let Some(rest) = req.strip_prefix(NNZ_PREFIX) {
            return self.nnz_reply(rest);
        }
        "ERR: Unknown reqtype".to_string()
    }

    /// Seed-phase variant: `PUT` mutates, everything else goes through
    /// the read path (which reports `Not readable` until the freeze).
    fn apply(&mut self, req: &str) -> String {
        if let Some(rest) = req.strip_prefix(PUT_PREFIX) {
            return self.put_apply(rest);
        }
        self.process(req)
    }

    fn put_apply(&mut self, rest: &str) -> String {
        if !self.writeable {
            return "ERR: Not writeable".to_string();
        }
        // The key ends at the first space after at least one key byte;
        // the value runs to the end of the line, spaces included.
        // Splitting at a space byte is always a char boundary.
        let split = rest
            .as_bytes()
            .iter()
            .skip(1)
            .position(|&b| b == b' ')
            .map(|i| i + 1);
        let Some(split) = split else {
            return "ERR: No key".to_string();
        };
        self.map
            .insert(rest[..split].to_string(), rest[split + 1..].to_string());
        "SUCCESS".to_string()
    }

    fn key_has_space(rest: &str) -> bool {
        rest.as_bytes().iter().skip(1).any(|&b| b == b' ')
    }

    fn get_reply(&self, key: &str) -> String {
        if !self.readable {
            return "ERR: Not readable".to_string();
        }
        if Self::key_has_space(key) {
            return "ERR: Key contains space".to_string();
        }
        match self.map.get(key) {
            Some(value) => value.clone(),
            None => format!("ERR: Bad key {key}"),
        }
    }

    fn szof_reply(&self, key: &str) -> String {
        if !self.readable {
            return "ERR: Not readable".to_string();
        }
        if Self::key_has_space(key) {
            return "ERR: Key contains space".to_string();
        }
        match self.map.get(key) {
            Some(value) => value.len().to_string(),
            None => "ERR: Bad key".to_string(),
        }
    }

    fn nnz_reply(&self, key: &str) -> String {
        if !self.readable {
            return "ERR: Not readable".to_string();
        }
        if Self::key_has_space(key) {
            return "ERR: Key contains space".to_string();
        }
        match self.map.get(key) {
            Some(value) => value.bytes().filter(|&b| b != b'0').count().to_string(),
            None => "ERR: Bad key".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn seeded(lines: &[&str]) -> KvStore {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        KvStore::load(Some(file.path()))
    }

    #[test]
    fn test_get_round_trip() {
        let store = seeded(&["PUT foo bar"]);
        assert_eq!(store.process("GET foo"), "bar");
    }

    #[test]
    fn test_get_missing_names_the_key() {
        let store = KvStore::load(None);
        assert_eq!(store.process("GET missing"), "ERR: Bad key missing");
    }

    #[test]
    fn test_put_value_keeps_spaces() {
        let store = seeded(&["PUT greeting hello there world"]);
        assert_eq!(store.process("GET greeting"), "hello there world");
    }

    #[test]
    fn test_runtime_put_rejected() {
        let store = seeded(&["PUT foo bar"]);
        assert_eq!(store.process("PUT foo baz"), "ERR: Not writeable");
        assert_eq!(store.process("GET foo"), "bar");
    }

    #[test]
    fn test_szof_counts_value_bytes() {
        let store = seeded(&["PUT k 10203"]);
        assert_eq!(store.process("SZOF k"), "5");
        assert_eq!(store.process("SZOF gone"), "ERR: Bad key");
    }

    #[test]
    fn test_nnz_counts_nonzero_bytes() {
        let store = seeded(&["PUT k 10203"]);
        assert_eq!(store.process("NNZ k"), "3");
        assert_eq!(store.process("NNZ gone"), "ERR: Bad key");
    }

    #[test]
    fn test_key_with_space_rejected() {
        let store = seeded(&["PUT foo bar"]);
        assert_eq!(store.process("GET foo extra"), "ERR: Key contains space");
    }

    #[test]
    fn test_unknown_command() {
        let store = KvStore::load(None);
        assert_eq!(store.process("DEL foo"), "ERR: Unknown reqtype");
        assert_eq!(store.process(""), "ERR: Unknown reqtype");
    }

    #[test]
    fn test_seed_line_without_value_is_skipped() {
        let store = seeded(&["PUT orphan", "PUT ok fine"]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.process("GET ok"), "fine");
    }

    #[test]
    fn test_missing_seed_file_yields_empty_store() {
        let store = KvStore::load(Some(Path::new("/nonexistent/seed.cmds")));
        assert!(store.is_empty());
        assert_eq!(store.process("GET anything"), "ERR: Bad key anything");
    }
}
