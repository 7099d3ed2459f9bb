//! Property-based checks of the mapping/segment invariants from the
//! spec's "testable properties" section, run against the real `Ftl` so
//! they see exactly what a host would. White-box (reaches into `inner`)
//! because the invariants are about bookkeeping the public API doesn't
//! expose, unlike the black-box round-trip checks in `tests/`.

use alloc::vec;
use alloc::vec::Vec;

use proptest::prelude::*;

use crate::config::DeviceGeometry;
use crate::config::PADDR_EMPTY;
use crate::device::{unpack_ppn, RamDevice};
use crate::Ftl;

#[derive(Debug, Clone)]
enum Op {
    Write { lpn: usize, byte: u8 },
    Trim,
}

fn op_strategy(nr_lpns: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        8 => (0..nr_lpns, any::<u8>()).prop_map(|(lpn, byte)| Op::Write { lpn, byte }),
        1 => Just(Op::Trim),
    ]
}

fn geo() -> DeviceGeometry {
    DeviceGeometry {
        page_size: 16,
        pages_per_segment: 4,
        nr_segments: 6,
    }
}

/// After every write, the model's view of that LPN must match a read;
/// and for every currently-mapped LPN, it must appear in exactly its
/// segment's `lpn_list` with the matching `use_bits` bit set
/// (invariant 1), and `nr_valid_pages` must equal `lpn_list`'s length
/// (invariant 2).
fn check_invariants(ftl: &Ftl<RamDevice>, nr_lpns: usize) {
    let inner = ftl.inner.lock();
    let page_bits = ftl.geometry().page_bits();

    for lpn in 0..nr_lpns {
        let ppn = inner.lookup(lpn);
        if ppn == PADDR_EMPTY {
            continue;
        }
        let (segnum, _page) = unpack_ppn(ppn, page_bits);
        let segment = inner.segments.get(segnum);
        let occurrences = segment.lpn_list().iter().filter(|&&l| l == lpn).count();
        assert_eq!(occurrences, 1, "lpn {lpn} should appear exactly once in segment {segnum}'s lpn_list");
    }

    for segnum in 0..inner.segments.len() {
        let segment = inner.segments.get(segnum);
        assert_eq!(
            segment.nr_valid_pages(),
            segment.lpn_list().len(),
            "segment {segnum}: nr_valid_pages must track lpn_list length"
        );
        assert!(
            segment.nr_valid_pages() <= inner.segments.pages_per_segment() - segment.nr_free_pages(),
            "segment {segnum}: valid pages cannot exceed programmed pages"
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn invariants_hold_after_any_write_trim_sequence(
        ops in prop::collection::vec(op_strategy(6), 1..=200)
    ) {
        let geometry = geo();
        let ftl = Ftl::open(RamDevice::new(geometry));
        let nr_lpns = 6;
        let mut model: Vec<Option<u8>> = vec![None; nr_lpns];

        for op in &ops {
            match *op {
                Op::Write { lpn, byte } => {
                    let sector = (lpn * geometry.page_size) as u64;
                    if ftl.write(sector, &vec![byte; geometry.page_size]).is_ok() {
                        model[lpn] = Some(byte);
                    }
                }
                Op::Trim => {
                    ftl.ioctl(crate::IoctlCmd::Trim).unwrap();
                }
            }
            check_invariants(&ftl, nr_lpns);
        }

        for (lpn, expected) in model.iter().enumerate() {
            let sector = (lpn * geometry.page_size) as u64;
            let mut out = vec![0u8; geometry.page_size];
            ftl.read(sector, &mut out).unwrap();
            let expected_bytes = match expected {
                Some(b) => vec![*b; geometry.page_size],
                None => vec![0u8; geometry.page_size],
            };
            prop_assert_eq!(out, expected_bytes, "lpn {} mismatch after op sequence", lpn);
        }
    }

    /// After a forced trim, every segment that had zero live pages at the
    /// moment trim ran ends up fully erased (invariant 3/4 from spec S4).
    #[test]
    fn trim_erases_every_segment_with_no_live_pages(
        ops in prop::collection::vec(op_strategy(6), 1..=120)
    ) {
        let geometry = geo();
        let ftl = Ftl::open(RamDevice::new(geometry));

        for op in &ops {
            if let Op::Write { lpn, byte } = *op {
                let sector = (lpn * geometry.page_size) as u64;
                let _ = ftl.write(sector, &vec![byte; geometry.page_size]);
            }
        }

        let empty_before: Vec<usize> = {
            let inner = ftl.inner.lock();
            (0..inner.segments.len())
                .filter(|&s| inner.segments.get(s).nr_valid_pages() == 0)
                .collect()
        };

        ftl.ioctl(crate::IoctlCmd::Trim).unwrap();

        let inner = ftl.inner.lock();
        for segnum in empty_before {
            prop_assert_eq!(inner.segments.get(segnum).nr_free_pages(), geometry.pages_per_segment);
            prop_assert_eq!(inner.segments.get(segnum).nr_valid_pages(), 0);
        }
    }
}
