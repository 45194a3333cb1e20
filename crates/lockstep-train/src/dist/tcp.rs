//! TCP rendezvous group: rank 0 accepts one connection per peer and performs
//! every reduction, the other ranks exchange frames with it only.
//!
//! Frame layout: `u64` element count (LE) followed by that many `f32` (LE).

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use super::collective::{check_root, Collective};
use crate::error::{config_error, JobError, JobResult};

const CONNECT_ATTEMPTS: usize = 600;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Rendezvous parameters, normally taken from the launcher's environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousConfig {
    pub rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl RendezvousConfig {
    /// Read `RANK`, `WORLD_SIZE`, `MASTER_ADDR` and `MASTER_PORT`.
    pub fn from_env() -> JobResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> JobResult<Self> {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> JobResult<T> {
            match raw {
                None => Ok(default),
                Some(v) => v
                    .trim()
                    .parse()
                    .map_err(|_| config_error(format!("{} must be an integer, got '{}'", key, v))),
            }
        }

        let rank = parse("RANK", lookup("RANK"), 0usize)?;
        let world_size = parse("WORLD_SIZE", lookup("WORLD_SIZE"), 1usize)?;
        let master_port = parse("MASTER_PORT", lookup("MASTER_PORT"), 6000u16)?;
        let master_addr = lookup("MASTER_ADDR").unwrap_or_else(|| "localhost".to_string());

        if world_size == 0 || rank >= world_size {
            return Err(config_error(format!(
                "RANK ({}) must be below WORLD_SIZE ({})",
                rank, world_size
            )));
        }
        Ok(Self {
            rank,
            world_size,
            master_addr,
            master_port,
        })
    }
}

struct Peer {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Peer {
    fn new(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: BufWriter::new(stream),
        })
    }

    fn send(&mut self, data: &[f32]) -> std::io::Result<()> {
        self.writer.write_all(&(data.len() as u64).to_le_bytes())?;
        for v in data {
            self.writer.write_all(&v.to_le_bytes())?;
        }
        self.writer.flush()
    }

    fn recv_into(&mut self, out: &mut [f32]) -> std::io::Result<()> {
        let mut len_buf = [0u8; 8];
        self.reader.read_exact(&mut len_buf)?;
        let len = u64::from_le_bytes(len_buf) as usize;
        if len != out.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame carries {} elements, expected {}", len, out.len()),
            ));
        }
        let mut word = [0u8; 4];
        for slot in out.iter_mut() {
            self.reader.read_exact(&mut word)?;
            *slot = f32::from_le_bytes(word);
        }
        Ok(())
    }

    fn send_u32(&mut self, v: u32) -> std::io::Result<()> {
        self.writer.write_all(&v.to_le_bytes())?;
        self.writer.flush()
    }

    fn recv_u32(&mut self) -> std::io::Result<u32> {
        let mut buf = [0u8; 4];
        self.reader.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

enum Role {
    /// Rank 0: peers indexed by rank, slot 0 unused.
    Root(Vec<Option<Peer>>),
    Member(Peer),
}

pub struct TcpCollective {
    rank: usize,
    world_size: usize,
    role: Role,
}

impl TcpCollective {
    /// Join or host the group described by `cfg`.
    pub fn connect(cfg: &RendezvousConfig) -> JobResult<Self> {
        let addr = (cfg.master_addr.as_str(), cfg.master_port);
        if cfg.rank == 0 {
            let listener = TcpListener::bind(addr).map_err(|e| JobError::Collective {
                rank: 0,
                message: format!(
                    "bind {}:{} failed: {}",
                    cfg.master_addr, cfg.master_port, e
                ),
            })?;
            Self::host(listener, cfg.world_size)
        } else {
            Self::join(addr, cfg.rank, cfg.world_size)
        }
    }

    /// Rank 0: accept `world_size - 1` peers on `listener`.
    pub fn host(listener: TcpListener, world_size: usize) -> JobResult<Self> {
        let io_err = |e: std::io::Error| JobError::Collective {
            rank: 0,
            message: e.to_string(),
        };
        let mut peers: Vec<Option<Peer>> = (0..world_size).map(|_| None).collect();
        let mut joined = 1;
        while joined < world_size {
            let (stream, remote) = listener.accept().map_err(io_err)?;
            let mut peer = Peer::new(stream).map_err(io_err)?;
            let rank = peer.recv_u32().map_err(io_err)? as usize;
            let claimed_world = peer.recv_u32().map_err(io_err)? as usize;
            if rank == 0 || rank >= world_size || claimed_world != world_size {
                return Err(JobError::Collective {
                    rank: 0,
                    message: format!(
                        "peer {} announced rank {} of {} (group has {})",
                        remote, rank, claimed_world, world_size
                    ),
                });
            }
            if peers[rank].is_some() {
                return Err(JobError::Collective {
                    rank: 0,
                    message: format!("rank {} joined twice", rank),
                });
            }
            debug!(rank = rank, remote = %remote, "Peer joined");
            peers[rank] = Some(peer);
            joined += 1;
        }
        info!(world_size = world_size, "Rendezvous complete");
        Ok(Self {
            rank: 0,
            world_size,
            role: Role::Root(peers),
        })
    }

    /// Rank > 0: connect to the host, retrying while it starts up.
    pub fn join(addr: impl ToSocketAddrs + Copy, rank: usize, world_size: usize) -> JobResult<Self> {
        let io_err = |e: std::io::Error| JobError::Collective {
            rank,
            message: e.to_string(),
        };
        let mut last_err = None;
        for _ in 0..CONNECT_ATTEMPTS {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    let mut peer = Peer::new(stream).map_err(io_err)?;
                    peer.send_u32(rank as u32).map_err(io_err)?;
                    peer.send_u32(world_size as u32).map_err(io_err)?;
                    return Ok(Self {
                        rank,
                        world_size,
                        role: Role::Member(peer),
                    });
                }
                Err(e) => {
                    last_err = Some(e);
                    thread::sleep(CONNECT_BACKOFF);
                }
            }
        }
        Err(JobError::Collective {
            rank,
            message: format!(
                "could not reach rendezvous host: {}",
                last_err.map_or_else(|| "no attempt made".to_string(), |e| e.to_string())
            ),
        })
    }

    fn io_err(&self, e: std::io::Error) -> JobError {
        JobError::Collective {
            rank: self.rank,
            message: e.to_string(),
        }
    }
}

impl Collective for TcpCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&mut self, buf: &mut [f32]) -> JobResult<()> {
        let result = match &mut self.role {
            Role::Root(peers) => {
                let mut incoming = vec![0.0f32; buf.len()];
                let mut io = Ok(());
                for peer in peers.iter_mut().flatten() {
                    io = peer.recv_into(&mut incoming);
                    if io.is_err() {
                        break;
                    }
                    for (a, &v) in buf.iter_mut().zip(&incoming) {
                        *a += v;
                    }
                }
                let reduced: &[f32] = buf;
                io.and_then(|_| {
                    peers
                        .iter_mut()
                        .flatten()
                        .try_for_each(|peer| peer.send(reduced))
                })
            }
            Role::Member(host) => host.send(buf).and_then(|_| host.recv_into(buf)),
        };
        result.map_err(|e| self.io_err(e))
    }

    fn broadcast(&mut self, buf: &mut [f32], root: usize) -> JobResult<()> {
        check_root(self.rank, self.world_size, root)?;
        let result = match &mut self.role {
            Role::Root(peers) => {
                let relay = if root == 0 {
                    Ok(())
                } else {
                    match peers[root].as_mut() {
                        Some(source) => source.recv_into(buf),
                        None => Err(std::io::Error::new(
                            std::io::ErrorKind::NotConnected,
                            format!("rank {} is not connected", root),
                        )),
                    }
                };
                let payload: &[f32] = buf;
                relay.and_then(|_| {
                    peers
                        .iter_mut()
                        .enumerate()
                        .filter(|(r, _)| *r != root)
                        .filter_map(|(_, p)| p.as_mut())
                        .try_for_each(|peer| peer.send(payload))
                })
            }
            Role::Member(host) => {
                if self.rank == root {
                    host.send(buf)
                } else {
                    host.recv_into(buf)
                }
            }
        };
        result.map_err(|e| self.io_err(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;

    fn spawn_group<F, T>(world_size: usize, f: F) -> Vec<T>
    where
        F: Fn(TcpCollective) -> T + Send + Sync + Clone + 'static,
        T: Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();

        let mut handles = Vec::new();
        for rank in 1..world_size {
            let f = f.clone();
            handles.push(thread::spawn(move || {
                f(TcpCollective::join(addr, rank, world_size).unwrap())
            }));
        }
        let root = TcpCollective::host(listener, world_size).unwrap();
        let mut results = vec![f(root)];
        results.extend(handles.into_iter().map(|h| h.join().unwrap()));
        results
    }

    #[test]
    fn test_rendezvous_env_defaults() {
        let cfg = RendezvousConfig::from_lookup(|_| None).unwrap();
        assert_eq!(
            cfg,
            RendezvousConfig {
                rank: 0,
                world_size: 1,
                master_addr: "localhost".to_string(),
                master_port: 6000,
            }
        );
    }

    #[test]
    fn test_rendezvous_env_values() {
        let env: HashMap<&str, &str> = [
            ("RANK", "3"),
            ("WORLD_SIZE", "8"),
            ("MASTER_ADDR", "10.0.0.1"),
            ("MASTER_PORT", "29500"),
        ]
        .into_iter()
        .collect();
        let cfg = RendezvousConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.rank, 3);
        assert_eq!(cfg.world_size, 8);
        assert_eq!(cfg.master_addr, "10.0.0.1");
        assert_eq!(cfg.master_port, 29500);
    }

    #[test]
    fn test_rendezvous_rejects_bad_rank() {
        let env: HashMap<&str, &str> = [("RANK", "2"), ("WORLD_SIZE", "2")].into_iter().collect();
        let err = RendezvousConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap_err();
        assert!(err.is_startup_error());

        let err = RendezvousConfig::from_lookup(|k| (k == "RANK").then(|| "x".to_string())).unwrap_err();
        assert!(err.is_startup_error());
    }

    #[test]
    fn test_tcp_all_reduce() {
        let results = spawn_group(3, |mut c| {
            let r = c.rank() as f32;
            let mut buf = vec![r, 1.0, -r];
            c.all_reduce_sum(&mut buf).unwrap();
            let mean = c.all_reduce_mean(c.rank() as f64).unwrap();
            (buf, mean)
        });
        for (buf, mean) in results {
            assert_eq!(buf, vec![3.0, 3.0, -3.0]);
            assert_eq!(mean, 1.0);
        }
    }

    #[test]
    fn test_tcp_broadcast_from_member() {
        let results = spawn_group(3, |mut c| {
            let mut buf = vec![c.rank() as f32 + 0.5; 4];
            c.broadcast(&mut buf, 2).unwrap();
            let mut from_root = vec![c.rank() as f32; 2];
            c.broadcast(&mut from_root, 0).unwrap();
            (buf, from_root)
        });
        for (buf, from_root) in results {
            assert_eq!(buf, vec![2.5; 4]);
            assert_eq!(from_root, vec![0.0; 2]);
        }
    }
}
