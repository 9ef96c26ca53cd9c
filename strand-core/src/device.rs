// vim: tw=80
//! Session-wide cache of resolved storage device identifiers
//!
//! Layout bodies name their storage backends by opaque `DeviceId`.  Resolving
//! an id costs a round trip to the metadata server, so each id is resolved at
//! most once per session no matter how many layouts or tasks race on it.

use std::{
    collections::HashMap,
    hash::BuildHasherDefault,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use futures::channel::oneshot;
use metrohash::MetroHash64;

use crate::{
    client::MetadataServer,
    io::{Connector, DataServer},
    types::{DeviceId, Error, Result},
};

/// One resolved storage device.
///
/// The node is shared by every layout segment that stripes onto this device.
/// `refs` counts those segments plus any in-flight I/O helpers; when it drops
/// to zero the node is unhashed from the cache and its connection torn down.
pub struct DeviceNode {
    pub id: DeviceId,
    /// Multipath addresses, in the server's preference order
    pub addrs: Vec<String>,
    refs: AtomicU32,
    /// Established lazily on first I/O, one slot per address
    conns: tokio::sync::Mutex<Vec<Option<Arc<dyn DataServer>>>>,
}

impl DeviceNode {
    fn new(id: DeviceId, addrs: Vec<String>) -> Self {
        let nconns = addrs.len();
        DeviceNode {
            id,
            addrs,
            refs: AtomicU32::new(1),
            conns: tokio::sync::Mutex::new(
                std::iter::repeat_with(|| None).take(nconns).collect()),
        }
    }

    /// Take an additional reference, unless the node is already being torn
    /// down.
    fn get_unless_zero(&self) -> bool {
        self.refs.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |r| {
            if r == 0 { None } else { Some(r + 1) }
        }).is_ok()
    }

    #[cfg(test)]
    pub fn refcount(&self) -> u32 {
        self.refs.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for DeviceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DeviceNode")
            .field("id", &self.id)
            .field("addrs", &self.addrs)
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

type NodeMap =
    HashMap<DeviceId, Arc<DeviceNode>, BuildHasherDefault<MetroHash64>>;

#[derive(Default)]
struct Inner {
    nodes: NodeMap,
    /// Ids with a resolution in flight, and the tasks waiting on it
    pending: HashMap<DeviceId, Vec<oneshot::Sender<()>>>,
}

/// The per-session device cache.
pub struct DeviceCache {
    inner: Mutex<Inner>,
    connector: Arc<dyn Connector>,
}

impl DeviceCache {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        DeviceCache {
            inner: Mutex::new(Inner::default()),
            connector,
        }
    }

    /// Look up an already-resolved device, taking a reference on it.
    pub fn find(&self, id: &DeviceId) -> Option<Arc<DeviceNode>> {
        let guard = self.inner.lock().unwrap();
        guard.nodes.get(id)
            .filter(|node| node.get_unless_zero())
            .cloned()
    }

    /// Resolve `id`, fetching device info from the metadata server if no
    /// cached node exists.  Concurrent resolutions of the same id collapse
    /// into a single fetch.
    ///
    /// On success the caller owns one reference, released with
    /// [`DeviceCache::release`].
    pub async fn resolve(
        &self,
        id: DeviceId,
        server: &dyn MetadataServer,
    ) -> Result<Arc<DeviceNode>> {
        let rx = {
            let mut guard = self.inner.lock().unwrap();
            if let Some(node) = guard.nodes.get(&id) {
                if node.get_unless_zero() {
                    return Ok(node.clone());
                }
                // Teardown in progress; fall through and refetch
            }
            if let Some(v) = guard.pending.get_mut(&id) {
                let (tx, rx) = oneshot::channel();
                v.push(tx);
                Some(rx)
            } else {
                guard.pending.insert(id, Vec::new());
                None
            }
        };
        if let Some(rx) = rx {
            // Another task owns the fetch.  Wake up and look again; if the
            // fetch failed the node will be absent.
            let _ = rx.await;
            let guard = self.inner.lock().unwrap();
            return match guard.nodes.get(&id) {
                Some(node) if node.get_unless_zero() => Ok(node.clone()),
                _ => Err(Error::NoDevice),
            };
        }

        let r = server.getdeviceinfo(id).await;
        let mut guard = self.inner.lock().unwrap();
        let out = match r {
            Ok(addrs) => {
                tracing::debug!(?id, naddrs = addrs.len(), "resolved device");
                let node = Arc::new(DeviceNode::new(id, addrs));
                // Collapse with a concurrent publication, if any beat us
                match guard.nodes.get(&id) {
                    Some(extant) if extant.get_unless_zero() => {
                        Ok(extant.clone())
                    }
                    _ => {
                        guard.nodes.insert(id, node.clone());
                        Ok(node)
                    }
                }
            }
            Err(e) => {
                tracing::warn!(?id, error = %e, "device resolution failed");
                Err(e)
            }
        };
        if let Some(v) = guard.pending.remove(&id) {
            for tx in v.into_iter() {
                let _ = tx.send(());
            }
        }
        drop(guard);
        out
    }

    /// Drop one reference to `node`.  The final reference unhashes the node
    /// and tears down its connection.
    pub fn release(&self, node: &Arc<DeviceNode>) {
        if node.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let conns = {
            let mut guard = self.inner.lock().unwrap();
            // A raced resolve may have replaced the entry already
            match guard.nodes.get(&node.id) {
                Some(extant) if Arc::ptr_eq(extant, node) => {
                    guard.nodes.remove(&node.id);
                }
                _ => ()
            }
            node.conns.try_lock()
                .map(|mut g| std::mem::take(&mut *g))
                .unwrap_or_default()
        };
        drop(conns);
        tracing::debug!(id = ?node.id, "device node freed");
    }

    /// Connect to one of the device's addresses, or reuse the established
    /// connection.  The double-checked slot keeps a racing second connect
    /// from replacing an established connection.
    pub async fn connect(&self, node: &Arc<DeviceNode>, index: usize)
        -> Result<Arc<dyn DataServer>>
    {
        let addr = node.addrs.get(index).ok_or(Error::NoDevice)?.clone();
        let mut guard = node.conns.lock().await;
        if let Some(ds) = guard[index].as_ref() {
            return Ok(ds.clone());
        }
        let ds = self.connector.connect(&addr).await
            .map_err(Error::Device)?;
        guard[index] = Some(ds.clone());
        Ok(ds)
    }

    /// How many device ids are currently resolved?
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for DeviceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DeviceCache")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Owns one device cache reference, releasing it on drop.
///
/// Layout segment payloads hold these so that a segment's devices outlive
/// the segment itself by exactly nothing.
pub struct DeviceRef {
    cache: Arc<DeviceCache>,
    node: Arc<DeviceNode>,
}

impl DeviceRef {
    pub fn new(cache: Arc<DeviceCache>, node: Arc<DeviceNode>) -> Self {
        DeviceRef { cache, node }
    }

    pub fn node(&self) -> &Arc<DeviceNode> {
        &self.node
    }

    pub fn cache(&self) -> &Arc<DeviceCache> {
        &self.cache
    }
}

#[cfg(test)]
impl DeviceRef {
    /// A self-contained device reference for payload construction in tests
    pub(crate) fn stub() -> Self {
        let cache = Arc::new(DeviceCache::new(
            Arc::new(crate::io::MockConnector::new())));
        let node = Arc::new(DeviceNode::new(
            DeviceId([0; 16]), vec!["stub".to_string()]));
        DeviceRef::new(cache, node)
    }
}

impl std::fmt::Debug for DeviceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DeviceRef").field("node", &self.node).finish()
    }
}

impl Drop for DeviceRef {
    fn drop(&mut self) {
        self.cache.release(&self.node);
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use std::sync::atomic::AtomicUsize;

use pretty_assertions::assert_eq;

use crate::client::MockMetadataServer;
use crate::io::MockConnector;
use super::*;

fn devid(b: u8) -> DeviceId {
    DeviceId([b; 16])
}

fn cache() -> Arc<DeviceCache> {
    Arc::new(DeviceCache::new(Arc::new(MockConnector::new())))
}

#[tokio::test]
async fn resolve_and_find() {
    let cache = cache();
    let mut server = MockMetadataServer::new();
    server.expect_getdeviceinfo()
        .times(1)
        .returning(|_| Ok(vec!["10.0.0.1:2049".to_string()]));

    let node = cache.resolve(devid(1), &server).await.unwrap();
    assert_eq!(node.addrs, vec!["10.0.0.1:2049".to_string()]);
    assert_eq!(cache.len(), 1);

    let node2 = cache.find(&devid(1)).unwrap();
    assert!(Arc::ptr_eq(&node, &node2));
    assert_eq!(node.refcount(), 2);

    cache.release(&node2);
    cache.release(&node);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn resolve_failure_not_published() {
    let cache = cache();
    let mut server = MockMetadataServer::new();
    server.expect_getdeviceinfo()
        .times(1)
        .returning(|_| Err(Error::NoDevice));

    assert_eq!(cache.resolve(devid(2), &server).await.unwrap_err(),
               Error::NoDevice);
    assert!(cache.is_empty());
    assert!(cache.find(&devid(2)).is_none());
}

/// Concurrent resolutions of the same id must collapse into one fetch and
/// yield the same node.
#[tokio::test]
async fn resolve_single_flight() {
    let cache = cache();
    let fetches = Arc::new(AtomicUsize::new(0));
    let mut server = MockMetadataServer::new();
    let fetches2 = fetches.clone();
    server.expect_getdeviceinfo()
        .returning(move |_| {
            fetches2.fetch_add(1, Ordering::Relaxed);
            Ok(vec!["ds1".to_string()])
        });
    let server = Arc::new(server);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let cache2 = cache.clone();
        let server2 = server.clone();
        tasks.push(tokio::spawn(async move {
            cache2.resolve(devid(3), server2.as_ref()).await.unwrap()
        }));
    }
    let mut nodes = Vec::new();
    for t in tasks {
        nodes.push(t.await.unwrap());
    }
    assert_eq!(fetches.load(Ordering::Relaxed), 1);
    assert!(nodes.iter().all(|n| Arc::ptr_eq(n, &nodes[0])));
    assert_eq!(nodes[0].refcount(), 16);
    for n in nodes.iter() {
        cache.release(n);
    }
    assert!(cache.is_empty());
}

#[tokio::test]
async fn release_final_ref_unhashes() {
    let cache = cache();
    let mut server = MockMetadataServer::new();
    server.expect_getdeviceinfo()
        .times(2)
        .returning(|_| Ok(vec!["ds1".to_string()]));

    let node = cache.resolve(devid(4), &server).await.unwrap();
    cache.release(&node);
    assert!(cache.find(&devid(4)).is_none());

    // A fresh resolve must fetch again
    let node2 = cache.resolve(devid(4), &server).await.unwrap();
    assert!(!Arc::ptr_eq(&node, &node2));
    cache.release(&node2);
}
}
// LCOV_EXCL_STOP
