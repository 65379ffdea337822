//! The in-memory transport provided by mercury_core.

use mercury_api::{config::*, transport::*, *};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

/// The in-memory stub transport provided by mercury_core.
/// This is NOT a production module. It is for testing only.
/// It will only reach nodes within the same process.
#[derive(Debug)]
pub struct MemTransportFactory {}

impl MemTransportFactory {
    /// Construct a new MemTransportFactory.
    pub fn create() -> DynTransportFactory {
        let out: DynTransportFactory = Arc::new(MemTransportFactory {});
        out
    }
}

impl TransportFactory for MemTransportFactory {
    fn default_config(&self, _config: &mut Config) -> MercResult<()> {
        Ok(())
    }

    fn validate_config(&self, _config: &Config) -> MercResult<()> {
        Ok(())
    }

    fn create(
        &self,
        _builder: Arc<builder::Builder>,
        handler: DynTxHandler,
    ) -> BoxFut<'static, MercResult<DynTransport>> {
        Box::pin(async move {
            let out: DynTransport = Arc::new(MemTransport::create(handler));
            Ok(out)
        })
    }
}

enum Frame {
    Data(PeerAddr, bytes::Bytes),
    Gone(PeerAddr),
}

type FrameSend = tokio::sync::mpsc::UnboundedSender<Frame>;
type FrameRecv = tokio::sync::mpsc::UnboundedReceiver<Frame>;

#[derive(Debug)]
struct MemTransport {
    id: u64,
    addr: PeerAddr,
    peers: Arc<Mutex<HashSet<PeerAddr>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for MemTransport {
    fn drop(&mut self) {
        self.task.abort();
        get_stat().remove(self.id);
        let peers = std::mem::take(&mut *self.peers.lock().unwrap());
        for peer in peers {
            get_stat().notify_gone(&peer, &self.addr);
        }
    }
}

impl MemTransport {
    fn create(handler: DynTxHandler) -> Self {
        let (id, addr, mut recv) = get_stat().listen();
        let peers = Arc::new(Mutex::new(HashSet::new()));

        let peers2 = peers.clone();
        let task = tokio::task::spawn(async move {
            while let Some(frame) = recv.recv().await {
                match frame {
                    Frame::Data(from, data) => {
                        peers2.lock().unwrap().insert(from.clone());
                        if let Err(err) = handler.recv_data(from.clone(), data)
                        {
                            tracing::debug!(?err, %from, "frame rejected");
                        }
                    }
                    Frame::Gone(from) => {
                        peers2.lock().unwrap().remove(&from);
                        handler.peer_disconnect(
                            from,
                            Some("connection closed".into()),
                        );
                    }
                }
            }
        });

        Self {
            id,
            addr,
            peers,
            task,
        }
    }
}

impl Transport for MemTransport {
    fn local_addr(&self) -> PeerAddr {
        self.addr.clone()
    }

    fn send(
        &self,
        peer: PeerAddr,
        data: bytes::Bytes,
    ) -> BoxFut<'_, MercResult<()>> {
        Box::pin(async move {
            get_stat().send(&peer, Frame::Data(self.addr.clone(), data))?;
            self.peers.lock().unwrap().insert(peer);
            Ok(())
        })
    }
}

const SCHEME: &str = "mem://";

fn parse_id(addr: &PeerAddr) -> Option<u64> {
    addr.as_str().strip_prefix(SCHEME)?.parse().ok()
}

/// This struct will be instantiated as a static global called STAT.
/// It holds the sending side of every live transport's inbox. Entries
/// are removed when the owning transport is dropped.
struct Stat {
    con_map: Mutex<HashMap<u64, FrameSend>>,
}

impl Stat {
    fn new() -> Self {
        Self {
            con_map: Mutex::new(HashMap::new()),
        }
    }

    /// "Bind" a new inbox.
    fn listen(&self) -> (u64, PeerAddr, FrameRecv) {
        use std::sync::atomic::*;
        static ID: AtomicU64 = AtomicU64::new(1);
        let id = ID.fetch_add(1, Ordering::Relaxed);
        let addr = PeerAddr::from(format!("{SCHEME}{id}").as_str());
        let (send, recv) = tokio::sync::mpsc::unbounded_channel();
        self.con_map.lock().unwrap().insert(id, send);
        (id, addr, recv)
    }

    /// Remove an inbox. Called by [MemTransport::drop].
    fn remove(&self, id: u64) {
        self.con_map.lock().unwrap().remove(&id);
    }

    fn send(&self, to: &PeerAddr, frame: Frame) -> MercResult<()> {
        let id = parse_id(to).ok_or_else(|| {
            MercError::other(format!("not a mem transport address: {to}"))
        })?;
        let send = self.con_map.lock().unwrap().get(&id).cloned();
        match send {
            Some(send) if send.send(frame).is_ok() => Ok(()),
            _ => Err(MercError::other(format!("peer unreachable: {to}"))),
        }
    }

    fn notify_gone(&self, to: &PeerAddr, gone: &PeerAddr) {
        let _ = self.send(to, Frame::Gone(gone.clone()));
    }
}

/// This is our static global instance of the [Stat] struct.
static STAT: OnceLock<Stat> = OnceLock::new();
fn get_stat() -> &'static Stat {
    STAT.get_or_init(Stat::new)
}
