mod common;

use common::{Rig, hw_info};
use kernel_smmu::resources::IndexBitmap;
use kernel_smmu::{DeviceId, SmmuConfig};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn racing_allocators_never_share_an_index() {
    let map = Arc::new(IndexBitmap::new());
    let threads = 8;
    let start = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let map = Arc::clone(&map);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                let mut mine = Vec::new();
                while let Some(idx) = map.alloc_in(0, 128) {
                    mine.push(idx);
                    thread::yield_now();
                }
                mine
            })
        })
        .collect();

    let mut all: Vec<u8> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    all.sort_unstable();
    assert_eq!(all, (0..128).collect::<Vec<u8>>());
    assert_eq!(map.count(), 128);
}

#[test]
fn parallel_attach_and_detach_keep_the_controller_consistent() {
    let rig = Arc::new(Rig::build(SmmuConfig::default(), hw_info(16), |_| {}));
    let threads = 8u16;
    for i in 0..threads {
        rig.device(u32::from(i), 0x100 + i);
    }

    let enables = rig.regulator.enables.load(Ordering::Relaxed);

    let start = Arc::new(Barrier::new(usize::from(threads)));
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let rig = Arc::clone(&rig);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let domain = rig.domain(u32::from(i) + 1);
                start.wait();
                domain.attach(&rig.smmu, DeviceId(u32::from(i))).unwrap();
                domain
            })
        })
        .collect();
    let domains: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let mut banks: Vec<u8> = domains.iter().map(|d| d.context_bank().unwrap()).collect();
    banks.sort_unstable();
    banks.dedup();
    assert_eq!(banks.len(), usize::from(threads));
    assert_eq!(rig.smmu.attach_count(), u32::from(threads));
    assert_eq!(rig.smmu.resources().contexts_in_use(), u32::from(threads));
    // The regulator came up once, however the attaches interleaved.
    assert_eq!(rig.regulator.enables.load(Ordering::Relaxed), enables + 1);

    let start = Arc::new(Barrier::new(usize::from(threads)));
    let handles: Vec<_> = domains
        .into_iter()
        .enumerate()
        .map(|(i, domain)| {
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                domain.detach(DeviceId(u32::try_from(i).unwrap())).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(rig.smmu.attach_count(), 0);
    assert_eq!(rig.smmu.resources().contexts_in_use(), 0);
    assert_eq!(rig.smmu.power().blocking_count(), 0);
    assert!(!rig.regulator.on.load(Ordering::Relaxed));
    assert_eq!(rig.pages.outstanding(), 0);
}
