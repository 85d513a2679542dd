//! Property-style checks over the estimation and storage primitives.

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;

use cmpsim_core::common::counter::FixedPointProbability;
use cmpsim_core::common::error::Fault;
use cmpsim_core::config::IqVariant;
use cmpsim_core::cpu::iq::InstQueue;
use cmpsim_core::cpu::spec_mem::{FunctionalMemory, MainMemory, SpeculativeMemory};
use cmpsim_core::mem::cache::tags::TagStore;

proptest! {
    /// The fixed-point interference probability equals
    /// `(shared - private) / shared` to within one LSB, with the
    /// documented saturation at the edges.
    #[test]
    fn interference_probability_within_one_lsb(
        private in 0i64..10_000,
        shared in 0i64..10_000,
        bits in 1u32..16,
    ) {
        let mut p = FixedPointProbability::new(bits);
        p.compute(shared - private, shared);
        let lsb = 1.0 / f64::from(1u32 << bits);
        if shared == 0 {
            prop_assert!((p.as_f64() - 1.0).abs() < 1e-12);
        } else if shared <= private {
            prop_assert!(p.as_f64() == 0.0);
        } else {
            let exact = (shared - private) as f64 / shared as f64;
            prop_assert!((p.as_f64() - exact).abs() < 1e-12);
            let fixed = f64::from(p.raw()) * lsb;
            prop_assert!((fixed - exact).abs() <= lsb);
        }
    }

    /// Speculative writes followed by a full squash leave memory
    /// exactly as it was.
    #[test]
    fn speculative_memory_isolation(
        writes in prop::collection::vec((0u64..64, 1u64..u64::MAX), 1..20),
    ) {
        let mut child = MainMemory::new();
        for i in 0u64..64 {
            let _ = child.write(i * 8, i + 1, 8);
        }
        let mut spec = SpeculativeMemory::new();
        let mut log = Vec::new();
        for &(slot, val) in &writes {
            log.push(spec.write(&mut child, slot * 8, val, 8).unwrap());
        }
        for &block in log.iter().rev() {
            spec.erase_block(block);
        }
        prop_assert!(spec.is_empty());
        for i in 0u64..64 {
            let (val, fault) = spec.read(&mut child, i * 8, 8);
            prop_assert_eq!(fault, Fault::None);
            prop_assert_eq!(val, i + 1);
        }
    }

    /// Set/tag extraction always inverts back to the block address.
    #[test]
    fn tag_extraction_round_trips(addr in 0u64..0x1_0000_0000) {
        let tags = TagStore::new(256, 8, 64, 1, None);
        let set = tags.extract_set(addr);
        let tag = tags.extract_tag(addr);
        prop_assert_eq!(tags.regenerate_addr(tag, set), addr & !63);
    }
}

/// All three queue organizations share the insert/wakeup contract.
#[rstest]
#[case(IqVariant::Unordered)]
#[case(IqVariant::ReadyQueue)]
#[case(IqVariant::Prescheduled)]
fn iq_variants_wake_dependents(#[case] variant: IqVariant) {
    let mut iq = InstQueue::new(variant, 16, 1, None, 4);
    iq.insert(1, 0, &[], 1, &[], &[7]).unwrap();
    iq.insert(2, 0, &[1], 1, &[7], &[8]).unwrap();
    iq.tick();
    assert_eq!(iq.ready_candidates(4), vec![1]);
    iq.remove(1);
    iq.writeback(1);
    // The consumer becomes issuable once its producer wrote back.
    let mut woke = false;
    for _ in 0..8 {
        iq.tick();
        if iq.ready_candidates(4) == vec![2] {
            woke = true;
            break;
        }
    }
    assert!(woke, "consumer never woke under {variant:?}");
}

/// Checkpoints written to disk restore through the file system too.
#[test]
fn tag_checkpoint_survives_a_file_round_trip() {
    use std::io::{BufReader, Seek, SeekFrom, Write as _};

    let mut tags = TagStore::new(16, 2, 64, 1, None);
    let _ = tags.replace(0x4000, 0, 0);
    let _ = tags.replace(0x8040, 0, 0);

    let mut file = tempfile::tempfile().unwrap();
    let mut buf = Vec::new();
    tags.serialize(&mut buf).unwrap();
    file.write_all(&buf).unwrap();
    let _ = file.seek(SeekFrom::Start(0)).unwrap();

    let mut restored = TagStore::new(16, 2, 64, 1, None);
    restored.unserialize(&mut BufReader::new(file)).unwrap();
    assert!(restored.find_no_update(0x4000, 0).is_some());
    assert!(restored.find_no_update(0x8040, 0).is_some());
}
