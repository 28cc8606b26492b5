//! Hop-limit termination on a simulated relay chain.

use crate::test_utils::*;
use emberlink_core::{Classification, ManualClock, BROADCAST};
use emberlink_transport::LinkHub;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[tokio::test]
async fn test_hop_limit_bounds_relay_chain() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(1_000));

    // Chain topology: a - b - c - d - e, one air space per segment. With
    // hop limit 2 the flood must reach d (relayed by b then c) and stop
    // there, leaving e dark.
    let h1 = LinkHub::new();
    let h2 = LinkHub::new();
    let h3 = LinkHub::new();
    let h4 = LinkHub::new();

    let a = spawn_short_node("a", &[h1.clone()], clock.clone(), |c| {
        c.relay.default_hop_limit = 2;
    });
    let b = spawn_short_node("b", &[h1.clone(), h2.clone()], clock.clone(), |_| {});
    let c = spawn_short_node("c", &[h2.clone(), h3.clone()], clock.clone(), |_| {});
    let d = spawn_short_node("d", &[h3.clone(), h4.clone()], clock.clone(), |_| {});
    let e = spawn_short_node("e", &[h4.clone()], clock.clone(), |_| {});

    let (b_hits, _sb) = count_deliveries(&b, Some(Classification::Announcement));
    let (c_hits, _sc) = count_deliveries(&c, Some(Classification::Announcement));
    let (d_hits, _sd) = count_deliveries(&d, Some(Classification::Announcement));
    let (e_hits, _se) = count_deliveries(&e, Some(Classification::Announcement));

    wait_until("chain discovery", || {
        a.status().unwrap().peer_count == 1
            && b.status().unwrap().peer_count == 2
            && c.status().unwrap().peer_count == 2
            && d.status().unwrap().peer_count == 2
            && e.status().unwrap().peer_count == 1
    })
    .await;

    a.submit(
        Classification::Announcement,
        BROADCAST,
        b"chain flood".to_vec(),
        60_000,
    )
    .unwrap();
    a.tick_now().await.unwrap();

    wait_until("flood reaches hop-limit boundary", || {
        d_hits.load(Ordering::SeqCst) == 1
    })
    .await;

    // Give a would-be fourth hop time to not happen
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    assert_eq!(b_hits.load(Ordering::SeqCst), 1);
    assert_eq!(c_hits.load(Ordering::SeqCst), 1);
    assert_eq!(d_hits.load(Ordering::SeqCst), 1);
    assert_eq!(e_hits.load(Ordering::SeqCst), 0, "hop limit must stop the flood at d");

    for node in [&a, &b, &c, &d, &e] {
        node.shutdown();
    }
}
