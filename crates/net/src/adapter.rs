//! Network adapters: the per-adapter RX queue/event and the global adapter
//! registry. Ethernet controllers register at driver attach; `loopback` is
//! registered once at boot.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use ksched::event::{event_trigger, Event};
use kcore::sync::SpinLock;

use crate::types::{Ipv4Addr, MacAddr};

/// Driver-side transmit hook: hands a fully built Ethernet frame to the
/// hardware (or, for `loopback`, back to the adapter's own RX queue).
pub trait AdapterDriver: Send + Sync {
    /// Transmits `frame` (Ethernet header onward) as-is.
    fn txpacket(&self, frame: &[u8]);
}

struct LoopbackDriver;

impl AdapterDriver for LoopbackDriver {
    fn txpacket(&self, frame: &[u8]) {
        if let Some(adapter) = loopback() {
            adapter.enqueue_rx(frame);
        }
    }
}

/// The adapter's static network configuration: address, mask, gateway, DNS,
/// and hardware address. Mutable post-registration (e.g. after DHCP).
#[derive(Clone, Copy, Debug)]
pub struct AdapterConfig {
    /// This adapter's IPv4 address.
    pub ip: Ipv4Addr,
    /// Subnet mask.
    pub mask: Ipv4Addr,
    /// Default gateway, or [`Ipv4Addr::ANY`] if none.
    pub gateway: Ipv4Addr,
    /// Configured DNS resolver, or [`Ipv4Addr::ANY`] if none.
    pub dns: Ipv4Addr,
    /// Hardware (MAC) address.
    pub mac: MacAddr,
}

impl AdapterConfig {
    /// `true` if `target` shares this adapter's subnet.
    #[must_use]
    pub fn is_local(&self, target: Ipv4Addr) -> bool {
        self.ip.same_subnet(target, self.mask)
    }
}

/// One network adapter: its configuration, RX queue, arrival event, ARP
/// cache, and the driver hook used to actually transmit frames.
pub struct Adapter {
    config: SpinLock<AdapterConfig>,
    rx_queue: SpinLock<VecDeque<Vec<u8>>>,
    /// Fires whenever a frame is enqueued to `rx_queue`.
    pub rx_event: Event,
    /// Per-adapter IPv4 identification counter (`adapter.ipframe++`).
    ipframe: AtomicU32,
    /// Resolved `(mac, last_seen_tick)` ARP entries keyed by big-endian IP.
    arp_cache: SpinLock<BTreeMap<u32, (MacAddr, u64)>>,
    driver: Box<dyn AdapterDriver>,
}

impl Adapter {
    fn new(config: AdapterConfig, driver: Box<dyn AdapterDriver>) -> Self {
        Self {
            config: SpinLock::new(config),
            rx_queue: SpinLock::new(VecDeque::new()),
            rx_event: Event::new(),
            ipframe: AtomicU32::new(0),
            arp_cache: SpinLock::new(BTreeMap::new()),
            driver,
        }
    }

    /// Snapshot of this adapter's current configuration.
    #[must_use]
    pub fn config(&self) -> AdapterConfig {
        *self.config.lock()
    }

    /// Replaces this adapter's configuration wholesale (e.g. after DHCP).
    pub fn set_config(&self, config: AdapterConfig) {
        *self.config.lock() = config;
    }

    /// Next IPv4 identification value; wraps at `u16::MAX` like the header
    /// field it feeds.
    pub fn next_ipframe_id(&self) -> u16 {
        self.ipframe.fetch_add(1, Ordering::Relaxed) as u16
    }

    /// Hands `frame` to the driver for transmission.
    pub fn txpacket(&self, frame: &[u8]) {
        self.driver.txpacket(frame);
    }

    /// Pushes a received frame onto the RX queue and triggers the arrival
    /// event for the inbound demultiplex thread.
    pub fn enqueue_rx(&self, frame: &[u8]) {
        self.rx_queue.lock().push_back(frame.to_vec());
        event_trigger(&self.rx_event, false);
    }

    /// Pops the oldest received frame, if any.
    pub fn dequeue_rx(&self) -> Option<Vec<u8>> {
        self.rx_queue.lock().pop_front()
    }

    /// Looks up a cached ARP resolution for `ip`.
    #[must_use]
    pub fn arp_lookup_cached(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.arp_cache.lock().get(&ip.to_u32()).map(|(mac, _)| *mac)
    }

    /// Records/refreshes an ARP resolution.
    pub fn arp_insert(&self, ip: Ipv4Addr, mac: MacAddr, tick: u64) {
        self.arp_cache.lock().insert(ip.to_u32(), (mac, tick));
    }
}

static ADAPTERS: SpinLock<Vec<Arc<Adapter>>> = SpinLock::new(Vec::new());
static LOOPBACK: SpinLock<Option<Arc<Adapter>>> = SpinLock::new(None);

/// Registers a new adapter (e.g. at Ethernet driver attach) and returns a
/// handle to it.
pub fn register(config: AdapterConfig, driver: Box<dyn AdapterDriver>) -> Arc<Adapter> {
    let adapter = Arc::new(Adapter::new(config, driver));
    ADAPTERS.lock().push(adapter.clone());
    adapter
}

/// Registers the loopback adapter (127.0.0.1/8) exactly once, at boot.
pub fn register_loopback() -> Arc<Adapter> {
    let adapter = register(
        AdapterConfig {
            ip: Ipv4Addr::LOOPBACK,
            mask: Ipv4Addr::new(255, 0, 0, 0),
            gateway: Ipv4Addr::ANY,
            dns: Ipv4Addr::ANY,
            mac: MacAddr::ZERO,
        },
        Box::new(LoopbackDriver),
    );
    *LOOPBACK.lock() = Some(adapter.clone());
    adapter
}

/// The registered loopback adapter, if [`register_loopback`] has run.
#[must_use]
pub fn loopback() -> Option<Arc<Adapter>> {
    LOOPBACK.lock().clone()
}

/// A snapshot of every registered adapter, in registration order.
#[must_use]
pub fn all() -> Vec<Arc<Adapter>> {
    ADAPTERS.lock().clone()
}

/// Finds the adapter whose configured IP is `ip`, if any.
#[must_use]
pub fn find_by_ip(ip: Ipv4Addr) -> Option<Arc<Adapter>> {
    ADAPTERS.lock().iter().find(|a| a.config().ip == ip).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    struct CountingDriver(AtomicUsize);
    impl AdapterDriver for CountingDriver {
        fn txpacket(&self, _frame: &[u8]) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn rx_queue_orders_fifo_and_signals_event() {
        let adapter = Adapter::new(
            AdapterConfig {
                ip: Ipv4Addr::new(10, 0, 0, 1),
                mask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: Ipv4Addr::ANY,
                dns: Ipv4Addr::ANY,
                mac: MacAddr::ZERO,
            },
            Box::new(CountingDriver(AtomicUsize::new(0))),
        );
        adapter.enqueue_rx(&[1, 2, 3]);
        adapter.enqueue_rx(&[4, 5, 6]);
        assert_eq!(adapter.dequeue_rx(), Some(alloc::vec![1, 2, 3]));
        assert_eq!(adapter.dequeue_rx(), Some(alloc::vec![4, 5, 6]));
        assert_eq!(adapter.dequeue_rx(), None);
    }

    #[test]
    fn ipframe_id_increments() {
        let adapter = Adapter::new(
            AdapterConfig {
                ip: Ipv4Addr::new(10, 0, 0, 1),
                mask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: Ipv4Addr::ANY,
                dns: Ipv4Addr::ANY,
                mac: MacAddr::ZERO,
            },
            Box::new(CountingDriver(AtomicUsize::new(0))),
        );
        assert_eq!(adapter.next_ipframe_id(), 0);
        assert_eq!(adapter.next_ipframe_id(), 1);
    }
}
