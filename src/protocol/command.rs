//! Command parsing and execution
//!
//! Turns an inbound array frame into a typed [`Command`] (with arity and
//! number checking) and applies data commands against the store. The
//! replication handshakes (`SYNC`/`PSYNC`) parse here but execute in the
//! reactor, which owns the connection they reconfigure.

use crate::engine::Store;
use crate::error::{OrionError, Result};

use super::Frame;

/// A parsed client command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    Set {
        key: Vec<u8>,
        value: Vec<u8>,
        ttl_ms: Option<i64>,
    },
    Get {
        key: Vec<u8>,
    },
    Del {
        keys: Vec<Vec<u8>>,
    },
    Exists {
        key: Vec<u8>,
    },
    Expire {
        key: Vec<u8>,
        seconds: i64,
    },
    Ttl {
        key: Vec<u8>,
    },
    Keys {
        pattern: Vec<u8>,
    },
    HSet {
        key: Vec<u8>,
        field: Vec<u8>,
        value: Vec<u8>,
    },
    HGet {
        key: Vec<u8>,
        field: Vec<u8>,
    },
    HDel {
        key: Vec<u8>,
        fields: Vec<Vec<u8>>,
    },
    HExists {
        key: Vec<u8>,
        field: Vec<u8>,
    },
    HGetAll {
        key: Vec<u8>,
    },
    HLen {
        key: Vec<u8>,
    },
    ZAdd {
        key: Vec<u8>,
        score: f64,
        member: Vec<u8>,
    },
    ZRem {
        key: Vec<u8>,
        members: Vec<Vec<u8>>,
    },
    ZRange {
        key: Vec<u8>,
        start: i64,
        stop: i64,
    },
    ZScore {
        key: Vec<u8>,
        member: Vec<u8>,
    },
    Sync,
    Psync {
        offset: u64,
    },
}

/// Extract the argv of a command frame: an array of bulk strings.
pub fn frame_to_argv(frame: &Frame) -> Option<Vec<Vec<u8>>> {
    let Frame::Array(items) = frame else {
        return None;
    };
    let mut argv = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Frame::Bulk(data) => argv.push(data.clone()),
            _ => return None,
        }
    }
    Some(argv)
}

impl Command {
    /// Parse an argv into a command, checking arity and numeric arguments.
    /// Command names are case-insensitive.
    pub fn parse(argv: &[Vec<u8>]) -> Result<Command> {
        let Some(name) = argv.first() else {
            return Err(OrionError::WrongArity(""));
        };
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();
        match name.as_str() {
            "PING" => {
                expect_arity(argv, 1, "ping")?;
                Ok(Command::Ping)
            }
            "SET" => {
                let ttl_ms = match argv.len() {
                    3 => None,
                    5 => {
                        let unit = String::from_utf8_lossy(&argv[3]).to_ascii_uppercase();
                        let amount = parse_i64(&argv[4])?;
                        match unit.as_str() {
                            "EX" => Some(amount.saturating_mul(1000)),
                            "PX" => Some(amount),
                            _ => return Err(OrionError::WrongArity("set")),
                        }
                    }
                    _ => return Err(OrionError::WrongArity("set")),
                };
                Ok(Command::Set {
                    key: argv[1].clone(),
                    value: argv[2].clone(),
                    ttl_ms,
                })
            }
            "GET" => {
                expect_arity(argv, 2, "get")?;
                Ok(Command::Get {
                    key: argv[1].clone(),
                })
            }
            "DEL" => {
                expect_min_arity(argv, 2, "del")?;
                Ok(Command::Del {
                    keys: argv[1..].to_vec(),
                })
            }
            "EXISTS" => {
                expect_arity(argv, 2, "exists")?;
                Ok(Command::Exists {
                    key: argv[1].clone(),
                })
            }
            "EXPIRE" => {
                expect_arity(argv, 3, "expire")?;
                Ok(Command::Expire {
                    key: argv[1].clone(),
                    seconds: parse_i64(&argv[2])?,
                })
            }
            "TTL" => {
                expect_arity(argv, 2, "ttl")?;
                Ok(Command::Ttl {
                    key: argv[1].clone(),
                })
            }
            "KEYS" => {
                expect_arity(argv, 2, "keys")?;
                Ok(Command::Keys {
                    pattern: argv[1].clone(),
                })
            }
            "HSET" => {
                expect_arity(argv, 4, "hset")?;
                Ok(Command::HSet {
                    key: argv[1].clone(),
                    field: argv[2].clone(),
                    value: argv[3].clone(),
                })
            }
            "HGET" => {
                expect_arity(argv, 3, "hget")?;
                Ok(Command::HGet {
                    key: argv[1].clone(),
                    field: argv[2].clone(),
                })
            }
            "HDEL" => {
                expect_min_arity(argv, 3, "hdel")?;
                Ok(Command::HDel {
                    key: argv[1].clone(),
                    fields: argv[2..].to_vec(),
                })
            }
            "HEXISTS" => {
                expect_arity(argv, 3, "hexists")?;
                Ok(Command::HExists {
                    key: argv[1].clone(),
                    field: argv[2].clone(),
                })
            }
            "HGETALL" => {
                expect_arity(argv, 2, "hgetall")?;
                Ok(Command::HGetAll {
                    key: argv[1].clone(),
                })
            }
            "HLEN" => {
                expect_arity(argv, 2, "hlen")?;
                Ok(Command::HLen {
                    key: argv[1].clone(),
                })
            }
            "ZADD" => {
                expect_arity(argv, 4, "zadd")?;
                Ok(Command::ZAdd {
                    key: argv[1].clone(),
                    score: parse_f64(&argv[2])?,
                    member: argv[3].clone(),
                })
            }
            "ZREM" => {
                expect_min_arity(argv, 3, "zrem")?;
                Ok(Command::ZRem {
                    key: argv[1].clone(),
                    members: argv[2..].to_vec(),
                })
            }
            "ZRANGE" => {
                expect_arity(argv, 4, "zrange")?;
                Ok(Command::ZRange {
                    key: argv[1].clone(),
                    start: parse_i64(&argv[2])?,
                    stop: parse_i64(&argv[3])?,
                })
            }
            "ZSCORE" => {
                expect_arity(argv, 3, "zscore")?;
                Ok(Command::ZScore {
                    key: argv[1].clone(),
                    member: argv[2].clone(),
                })
            }
            "SYNC" => {
                expect_arity(argv, 1, "sync")?;
                Ok(Command::Sync)
            }
            "PSYNC" => {
                expect_arity(argv, 2, "psync")?;
                let offset = parse_i64(&argv[1])?;
                if offset < 0 {
                    return Err(OrionError::ParseNumber);
                }
                Ok(Command::Psync {
                    offset: offset as u64,
                })
            }
            _ => Err(OrionError::UnknownCommand(name)),
        }
    }

    /// Whether this command changes engine state (and therefore must reach
    /// the append log and replicas)
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Command::Set { .. }
                | Command::Del { .. }
                | Command::Expire { .. }
                | Command::HSet { .. }
                | Command::HDel { .. }
                | Command::ZAdd { .. }
                | Command::ZRem { .. }
        )
    }
}

/// Execute a data command against the store and build its response frame.
///
/// `SYNC`/`PSYNC` are connection-level and are answered with an error here;
/// the reactor intercepts them before dispatch.
pub fn apply(store: &mut Store, cmd: &Command) -> Frame {
    match cmd {
        Command::Ping => Frame::Simple("PONG".into()),
        Command::Set { key, value, ttl_ms } => {
            store.set(key.clone(), value.clone(), *ttl_ms);
            Frame::Simple("OK".into())
        }
        Command::Get { key } => match store.get(key) {
            Some(value) => Frame::Bulk(value),
            None => Frame::NullBulk,
        },
        Command::Del { keys } => Frame::Integer(store.del(keys)),
        Command::Exists { key } => Frame::Integer(store.exists(key) as i64),
        Command::Expire { key, seconds } => Frame::Integer(store.expire(key, *seconds) as i64),
        Command::Ttl { key } => Frame::Integer(store.ttl(key)),
        Command::Keys { pattern } => {
            if pattern != b"*" {
                return Frame::Error("ERR only the * pattern is supported".into());
            }
            Frame::Array(store.keys().into_iter().map(Frame::Bulk).collect())
        }
        Command::HSet { key, field, value } => {
            Frame::Integer(store.hset(key.clone(), field.clone(), value.clone()))
        }
        Command::HGet { key, field } => match store.hget(key, field) {
            Some(value) => Frame::Bulk(value),
            None => Frame::NullBulk,
        },
        Command::HDel { key, fields } => Frame::Integer(store.hdel(key, fields)),
        Command::HExists { key, field } => Frame::Integer(store.hexists(key, field) as i64),
        Command::HGetAll { key } => {
            Frame::Array(store.hgetall_flat(key).into_iter().map(Frame::Bulk).collect())
        }
        Command::HLen { key } => Frame::Integer(store.hlen(key)),
        Command::ZAdd { key, score, member } => {
            Frame::Integer(store.zadd(key.clone(), *score, member.clone()))
        }
        Command::ZRem { key, members } => Frame::Integer(store.zrem(key, members)),
        Command::ZRange { key, start, stop } => Frame::Array(
            store
                .zrange(key, *start, *stop)
                .into_iter()
                .map(Frame::Bulk)
                .collect(),
        ),
        Command::ZScore { key, member } => match store.zscore(key, member) {
            Some(score) => Frame::Bulk(format_score(score).into_bytes()),
            None => Frame::NullBulk,
        },
        Command::Sync | Command::Psync { .. } => {
            Frame::Error("ERR SYNC is only valid on a client connection".into())
        }
    }
}

/// Decimal score rendering that survives a parse round-trip within the
/// ordering tolerance: six fractional digits, trailing zeros trimmed.
pub fn format_score(score: f64) -> String {
    let mut s = format!("{:.6}", score);
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
    s
}

fn expect_arity(argv: &[Vec<u8>], want: usize, name: &'static str) -> Result<()> {
    if argv.len() != want {
        return Err(OrionError::WrongArity(name));
    }
    Ok(())
}

fn expect_min_arity(argv: &[Vec<u8>], want: usize, name: &'static str) -> Result<()> {
    if argv.len() < want {
        return Err(OrionError::WrongArity(name));
    }
    Ok(())
}

fn parse_i64(raw: &[u8]) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(OrionError::ParseNumber)
}

fn parse_f64(raw: &[u8]) -> Result<f64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .ok_or(OrionError::ParseNumber)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_parse_set_variants() {
        assert_eq!(
            Command::parse(&argv(&["set", "k", "v"])).unwrap(),
            Command::Set {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                ttl_ms: None
            }
        );
        assert_eq!(
            Command::parse(&argv(&["SET", "k", "v", "EX", "10"])).unwrap(),
            Command::Set {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                ttl_ms: Some(10_000)
            }
        );
        assert_eq!(
            Command::parse(&argv(&["SET", "k", "v", "px", "50"])).unwrap(),
            Command::Set {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                ttl_ms: Some(50)
            }
        );
        assert!(matches!(
            Command::parse(&argv(&["SET", "k"])),
            Err(OrionError::WrongArity("set"))
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_and_bad_numbers() {
        assert!(matches!(
            Command::parse(&argv(&["FLUSHALL"])),
            Err(OrionError::UnknownCommand(_))
        ));
        assert!(matches!(
            Command::parse(&argv(&["EXPIRE", "k", "soon"])),
            Err(OrionError::ParseNumber)
        ));
        assert!(matches!(
            Command::parse(&argv(&["ZADD", "k", "nan", "m"])),
            Err(OrionError::ParseNumber)
        ));
    }

    #[test]
    fn test_mutating_classification() {
        let mutating = ["SET k v", "DEL k", "EXPIRE k 1", "HSET k f v", "HDEL k f", "ZADD k 1 m", "ZREM k m"];
        for line in mutating {
            let parts: Vec<&str> = line.split(' ').collect();
            let cmd = Command::parse(&argv(&parts)).unwrap();
            assert!(cmd.is_mutating(), "{} must be mutating", line);
        }
        let readonly = ["GET k", "TTL k", "EXISTS k", "ZRANGE k 0 -1", "HGETALL k", "KEYS *", "PING"];
        for line in readonly {
            let parts: Vec<&str> = line.split(' ').collect();
            let cmd = Command::parse(&argv(&parts)).unwrap();
            assert!(!cmd.is_mutating(), "{} must not be mutating", line);
        }
    }

    #[test]
    fn test_frame_to_argv_requires_bulk_array() {
        let ok = Frame::array_of_bulks([&b"GET"[..], b"k"]);
        assert_eq!(frame_to_argv(&ok).unwrap().len(), 2);

        let mixed = Frame::Array(vec![Frame::Integer(1)]);
        assert!(frame_to_argv(&mixed).is_none());
        assert!(frame_to_argv(&Frame::Simple("GET".into())).is_none());
    }

    #[test]
    fn test_format_score_round_trips() {
        for score in [1.0, 1.5, -3.25, 0.000001, 123456.789012] {
            let rendered = format_score(score);
            let back: f64 = rendered.parse().unwrap();
            assert!((back - score).abs() <= 1e-6, "{} -> {}", score, rendered);
        }
        assert_eq!(format_score(2.0), "2");
        assert_eq!(format_score(1.5), "1.5");
    }
}
