use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::peer::{Bitfield, PeerAddress, PeerConnection};
use crate::piece::{PieceResult, WorkItem, is_valid};
use crate::torrent::TorrentMetadata;

/// Pause after a worker went round the whole queue without finding a piece
/// its peer holds. Doubles on each idle round up to the maximum.
const MIN_IDLE_BACKOFF: Duration = Duration::from_millis(10);
const MAX_IDLE_BACKOFF: Duration = Duration::from_millis(500);

/// Pieces still waiting for a worker, shared by every worker.
///
/// Capacity equals the piece count and an item is only pushed back after
/// being popped, so a requeue never blocks.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<WorkItem>,
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
}

impl WorkQueue {
    pub fn new(items: Vec<WorkItem>) -> Self {
        let (tx, rx) = mpsc::channel(items.len().max(1));
        let queue = Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        };
        for item in items {
            queue.push(item);
        }
        queue
    }

    /// Returns `item` to the back of the queue.
    ///
    /// Never more than `capacity` items exist, so the queue cannot be full
    /// when an item comes back.
    pub fn push(&self, item: WorkItem) {
        let sent = self.tx.try_send(item);
        debug_assert!(sent.is_ok(), "work queue over capacity");
        if sent.is_err() {
            warn!(index = item.index, "work queue rejected a piece");
        }
    }

    /// Waits for the next piece.
    pub async fn pop(&self) -> Option<WorkItem> {
        self.rx.lock().await.recv().await
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

#[derive(Debug, Default)]
struct SwarmState {
    /// Workers still dialing or handshaking.
    connecting: usize,
    /// Availability of each live session, keyed by worker.
    sessions: HashMap<usize, Bitfield>,
}

/// What the live sessions can serve, so the aggregator can tell a slow
/// download from one that can no longer finish.
#[derive(Debug)]
struct Swarm {
    state: StdMutex<SwarmState>,
    changed: Notify,
}

impl Swarm {
    fn new(connecting: usize) -> Self {
        Self {
            state: StdMutex::new(SwarmState {
                connecting,
                sessions: HashMap::new(),
            }),
            changed: Notify::new(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut SwarmState)) {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner));
        self.changed.notify_one();
    }

    /// True while a peer is still connecting or some live session holds a
    /// piece that is not complete yet.
    fn can_finish(&self, completed: &[bool]) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.connecting > 0
            || completed
                .iter()
                .enumerate()
                .filter(|(_, done)| !**done)
                .any(|(index, _)| state.sessions.values().any(|b| b.has_piece(index)))
    }
}

/// One worker's entry in the [`Swarm`], withdrawn when the worker ends.
struct Membership {
    swarm: Arc<Swarm>,
    id: usize,
    connected: bool,
}

impl Membership {
    fn new(swarm: Arc<Swarm>, id: usize) -> Self {
        Self {
            swarm,
            id,
            connected: false,
        }
    }

    fn joined(&mut self, bitfield: &Bitfield) {
        let id = self.id;
        self.swarm.update(|state| {
            state.connecting = state.connecting.saturating_sub(1);
            state.sessions.insert(id, bitfield.clone());
        });
        self.connected = true;
    }

    fn refresh(&self, bitfield: &Bitfield) {
        let id = self.id;
        self.swarm.update(|state| {
            state.sessions.insert(id, bitfield.clone());
        });
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        let (id, connected) = (self.id, self.connected);
        self.swarm.update(|state| {
            if connected {
                state.sessions.remove(&id);
            } else {
                state.connecting = state.connecting.saturating_sub(1);
            }
        });
    }
}

/// Drives one download across a set of peers.
pub struct Downloader {
    torrent: Arc<TorrentMetadata>,
    peer_id: [u8; 20],
    config: DownloadConfig,
}

impl Downloader {
    pub fn new(torrent: TorrentMetadata, peer_id: [u8; 20], config: DownloadConfig) -> Self {
        Self {
            torrent: Arc::new(torrent),
            peer_id,
            config,
        }
    }

    /// Downloads every piece and returns the assembled content.
    ///
    /// Spawns one worker per peer and collects verified pieces until all are
    /// in. Fails with [`DownloadError::Stalled`] once no remaining piece is
    /// held by any live peer, or every worker has left.
    pub async fn download(&self, peers: Vec<PeerAddress>) -> Result<Vec<u8>, DownloadError> {
        if peers.is_empty() {
            return Err(DownloadError::NoPeers);
        }

        let total = self.torrent.piece_count();
        let queue = WorkQueue::new(WorkItem::for_torrent(&self.torrent));
        let (results_tx, mut results) = mpsc::channel(total.max(1));
        let swarm = Arc::new(Swarm::new(peers.len()));

        info!(
            name = %self.torrent.name,
            pieces = total,
            peers = peers.len(),
            "starting download"
        );

        let mut workers = JoinSet::new();
        for (id, addr) in peers.into_iter().enumerate() {
            workers.spawn(run_worker(
                addr,
                Membership::new(Arc::clone(&swarm), id),
                Arc::clone(&self.torrent),
                self.peer_id,
                self.config.clone(),
                queue.clone(),
                results_tx.clone(),
            ));
        }
        // Only workers hold senders now, so the channel closes when the last one leaves
        drop(results_tx);
        drop(queue);

        let mut buf = vec![0u8; self.torrent.length as usize];
        let mut completed = vec![false; total];
        let mut done = 0;

        while done < total {
            // Availability is read before polling: a worker publishes its
            // piece before withdrawing, so the piece is already queued here.
            let can_finish = swarm.can_finish(&completed);
            let piece = match results.try_recv() {
                Ok(piece) => piece,
                Err(TryRecvError::Empty) if can_finish => {
                    tokio::select! {
                        piece = results.recv() => match piece {
                            Some(piece) => piece,
                            None => break,
                        },
                        () = swarm.changed.notified() => continue,
                    }
                }
                Err(_) => break,
            };

            let index = piece.index as usize;
            match completed.get_mut(index) {
                Some(seen) if !*seen => *seen = true,
                _ => {
                    debug!(index, "ignoring duplicate piece");
                    continue;
                }
            }

            let range = self.torrent.piece_range(index);
            buf[range.start as usize..range.end as usize].copy_from_slice(&piece.data);
            done += 1;
            info!("piece {} complete ({}/{})", index, done, total);
        }

        workers.abort_all();
        if done < total {
            return Err(DownloadError::Stalled { done, total });
        }
        Ok(buf)
    }
}

/// Serves pieces from one peer until the peer fails or the download ends.
async fn run_worker(
    addr: PeerAddress,
    mut membership: Membership,
    torrent: Arc<TorrentMetadata>,
    peer_id: [u8; 20],
    config: DownloadConfig,
    queue: WorkQueue,
    results: mpsc::Sender<PieceResult>,
) {
    let mut conn = match PeerConnection::connect(addr, &torrent, peer_id, &config).await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(peer = %addr, %err, "could not start a session");
            return;
        }
    };
    membership.joined(&conn.state().bitfield);
    debug!(peer = %addr, "session ready");

    let mut misses = 0;
    let mut backoff = MIN_IDLE_BACKOFF;

    while let Some(item) = queue.pop().await {
        let index = item.index as usize;

        if !conn.has_piece(index) {
            queue.push(item);
            misses += 1;
            if misses > queue.capacity() {
                trace!(peer = %addr, ?backoff, "peer holds none of the queued pieces");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_IDLE_BACKOFF);
                misses = 0;
            } else {
                tokio::task::yield_now().await;
            }
            continue;
        }
        misses = 0;
        backoff = MIN_IDLE_BACKOFF;

        let downloaded = conn.download_piece(item.index, item.length).await;
        membership.refresh(&conn.state().bitfield);
        let data = match downloaded {
            Ok(data) => data,
            Err(err) => {
                queue.push(item);
                warn!(peer = %addr, index, %err, "dropping peer");
                return;
            }
        };

        if !is_valid(&data, index, &torrent.pieces) {
            warn!(peer = %addr, index, "piece failed integrity check");
            queue.push(item);
            continue;
        }

        let have = conn.send_have(item.index).await;
        if results
            .send(PieceResult {
                index: item.index,
                data,
            })
            .await
            .is_err()
        {
            return;
        }
        if let Err(err) = have {
            warn!(peer = %addr, %err, "dropping peer");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::handshake::exchange_handshake;
    use crate::peer::message::Bitfield;
    use crate::peer::{Handshake, Message};
    use crate::piece::hash_piece;
    use assert_matches::assert_matches;
    use std::collections::HashMap;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    const PIECE_LEN: u32 = 32768;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn torrent_for(data: &[u8]) -> TorrentMetadata {
        TorrentMetadata {
            announce: "http://127.0.0.1/announce".to_string(),
            info_hash: [7u8; 20],
            pieces: data.chunks(PIECE_LEN as usize).map(hash_piece).collect(),
            piece_length: PIECE_LEN,
            length: data.len() as u64,
            name: "content.bin".to_string(),
        }
    }

    fn config() -> DownloadConfig {
        DownloadConfig {
            connect_timeout: Duration::from_secs(1),
            piece_timeout: Duration::from_secs(5),
            ..DownloadConfig::default()
        }
    }

    /// Loopback peer serving `data`.
    #[derive(Clone)]
    struct FakeSeeder {
        data: Arc<Vec<u8>>,
        info_hash: [u8; 20],
        bitfield: Bitfield,
        /// Piece served with a flipped byte the first time it is requested.
        corrupt: Option<u32>,
        /// Requests seen per `(index, begin)`.
        requests: Arc<StdMutex<HashMap<(u32, u32), usize>>>,
        /// Wait before sending the bitfield.
        bitfield_delay: Duration,
        /// Wait before answering each request.
        reply_delay: Duration,
        /// Drop the connection this long after the first request instead of answering.
        hang_up_after: Option<Duration>,
    }

    impl FakeSeeder {
        fn new(data: &[u8], torrent: &TorrentMetadata) -> Self {
            Self {
                data: Arc::new(data.to_vec()),
                info_hash: torrent.info_hash,
                bitfield: Bitfield::full(torrent.piece_count()),
                corrupt: None,
                requests: Arc::default(),
                bitfield_delay: Duration::ZERO,
                reply_delay: Duration::ZERO,
                hang_up_after: None,
            }
        }

        fn request_count(&self, index: u32, begin: u32) -> usize {
            let requests = self.requests.lock().unwrap();
            requests.get(&(index, begin)).copied().unwrap_or(0)
        }

        async fn spawn(&self) -> PeerAddress {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            let SocketAddr::V4(addr) = listener.local_addr().unwrap() else {
                unreachable!("bound to an IPv4 address");
            };

            let seeder = self.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(seeder.clone().serve(stream));
                }
            });
            addr.into()
        }

        async fn serve(self, mut stream: TcpStream) {
            let ours = Handshake::new(self.info_hash, *b"-FS0001-seederseeder");
            if exchange_handshake(&mut stream, &ours, Duration::from_secs(5))
                .await
                .is_err()
            {
                return;
            }
            tokio::time::sleep(self.bitfield_delay).await;
            let bitfield = Message::Bitfield(self.bitfield.clone());
            if stream.write_all(&bitfield.serialize()).await.is_err() {
                return;
            }

            loop {
                let Ok(message) = crate::peer::client::read_message(&mut stream).await else {
                    return;
                };
                let reply = match message {
                    Message::Interested => Message::Unchoke,
                    Message::Request {
                        index,
                        begin,
                        length,
                    } => {
                        let seen = {
                            let mut requests = self.requests.lock().unwrap();
                            let count = requests.entry((index, begin)).or_insert(0);
                            *count += 1;
                            *count
                        };
                        if let Some(delay) = self.hang_up_after {
                            tokio::time::sleep(delay).await;
                            return;
                        }
                        tokio::time::sleep(self.reply_delay).await;

                        let start = (index * PIECE_LEN + begin) as usize;
                        let mut block = self.data[start..start + length as usize].to_vec();
                        if self.corrupt == Some(index) && begin == 0 && seen == 1 {
                            block[0] ^= 0xff;
                        }
                        Message::Piece {
                            index,
                            begin,
                            block,
                        }
                    }
                    _ => continue,
                };
                if stream.write_all(&reply.serialize()).await.is_err() {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_work_queue_requeue_stays_bounded() {
        let items: Vec<WorkItem> = (0..3)
            .map(|index| WorkItem {
                index,
                length: PIECE_LEN,
            })
            .collect();
        let queue = WorkQueue::new(items);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.capacity(), 3);

        let first = queue.pop().await.unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(queue.len(), 2);

        queue.push(first);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().await.unwrap().index, 1);
        assert_eq!(queue.pop().await.unwrap().index, 2);
        assert_eq!(queue.pop().await.unwrap().index, 0);
        assert!(queue.is_empty());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "work queue over capacity")]
    fn test_work_queue_never_drops_items_silently() {
        let item = WorkItem {
            index: 0,
            length: PIECE_LEN,
        };
        let queue = WorkQueue::new(vec![item]);
        queue.push(item);
    }

    #[tokio::test]
    async fn test_single_honest_peer() {
        let data = content(PIECE_LEN as usize * 3 + 1000);
        let torrent = torrent_for(&data);
        assert_eq!(torrent.piece_count(), 4);

        let seeder = FakeSeeder::new(&data, &torrent);
        let peer = seeder.spawn().await;

        let downloader = Downloader::new(torrent, [1u8; 20], config());
        let downloaded = downloader.download(vec![peer]).await.unwrap();
        assert_eq!(downloaded, data);

        // Every block was requested exactly once
        for index in 0..4 {
            assert_eq!(seeder.request_count(index, 0), 1);
        }
    }

    #[tokio::test]
    async fn test_corrupt_piece_is_retried() {
        let data = content(PIECE_LEN as usize * 3);
        let torrent = torrent_for(&data);

        let mut seeder = FakeSeeder::new(&data, &torrent);
        seeder.corrupt = Some(1);
        let peer = seeder.spawn().await;

        let downloader = Downloader::new(torrent, [1u8; 20], config());
        let downloaded = downloader.download(vec![peer]).await.unwrap();
        assert_eq!(downloaded, data);

        assert_eq!(seeder.request_count(1, 0), 2);
        assert_eq!(seeder.request_count(0, 0), 1);
        assert_eq!(seeder.request_count(2, 0), 1);
    }

    #[tokio::test]
    async fn test_pieces_split_across_peers() {
        let data = content(PIECE_LEN as usize * 4);
        let torrent = torrent_for(&data);

        let mut evens = FakeSeeder::new(&data, &torrent);
        evens.bitfield = Bitfield::from_piece_count(4);
        evens.bitfield.set_piece(0);
        evens.bitfield.set_piece(2);
        let mut odds = FakeSeeder::new(&data, &torrent);
        odds.bitfield = Bitfield::from_piece_count(4);
        odds.bitfield.set_piece(1);
        odds.bitfield.set_piece(3);

        let peers = vec![evens.spawn().await, odds.spawn().await];
        let downloader = Downloader::new(torrent, [1u8; 20], config());
        assert_eq!(downloader.download(peers).await.unwrap(), data);

        assert_eq!(evens.request_count(1, 0), 0);
        assert_eq!(odds.request_count(0, 0), 0);
    }

    #[tokio::test]
    async fn test_requeued_piece_reaches_waiting_peer() {
        let data = content(PIECE_LEN as usize * 3);
        let torrent = torrent_for(&data);

        let only = |index: usize| {
            let mut bitfield = Bitfield::from_piece_count(3);
            bitfield.set_piece(index);
            bitfield
        };

        // Takes piece 1 first and then hangs up on it
        let mut flaky = FakeSeeder::new(&data, &torrent);
        flaky.bitfield = only(1);
        flaky.hang_up_after = Some(Duration::from_millis(300));

        // Also has piece 1, but idles while the flaky peer holds it
        let mut late = FakeSeeder::new(&data, &torrent);
        late.bitfield = only(1);
        late.bitfield_delay = Duration::from_millis(100);

        let mut slow = FakeSeeder::new(&data, &torrent);
        slow.bitfield = only(0);
        slow.bitfield.set_piece(2);
        slow.reply_delay = Duration::from_millis(20);

        let peers = vec![flaky.spawn().await, late.spawn().await, slow.spawn().await];
        let downloader = Downloader::new(torrent, [1u8; 20], config());
        assert_eq!(downloader.download(peers).await.unwrap(), data);

        assert_eq!(flaky.request_count(1, 0), 1);
        assert_eq!(late.request_count(1, 0), 1);
        assert_eq!(slow.request_count(1, 0), 0);
    }

    #[tokio::test]
    async fn test_no_peers() {
        let data = content(100);
        let downloader = Downloader::new(torrent_for(&data), [1u8; 20], config());
        assert_matches!(
            downloader.download(Vec::new()).await,
            Err(DownloadError::NoPeers)
        );
    }

    #[tokio::test]
    async fn test_missing_piece_stalls() {
        let data = content(PIECE_LEN as usize * 3);
        let torrent = torrent_for(&data);

        let mut seeder = FakeSeeder::new(&data, &torrent);
        seeder.bitfield = Bitfield::from_piece_count(3);
        seeder.bitfield.set_piece(0);
        seeder.bitfield.set_piece(1);
        let peer = seeder.spawn().await;

        let downloader = Downloader::new(torrent, [1u8; 20], config());
        assert_matches!(
            downloader.download(vec![peer]).await,
            Err(DownloadError::Stalled { done: 2, total: 3 })
        );
    }

    #[tokio::test]
    async fn test_unreachable_peer_stalls() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let SocketAddr::V4(addr) = listener.local_addr().unwrap() else {
            unreachable!("bound to an IPv4 address");
        };
        drop(listener);

        let data = content(100);
        let downloader = Downloader::new(torrent_for(&data), [1u8; 20], config());
        assert_matches!(
            downloader.download(vec![addr.into()]).await,
            Err(DownloadError::Stalled { done: 0, total: 1 })
        );
    }
}
