use lease::time::{Advance, MonotonicExpiry, CLOSED};
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;

proptest! {
    #[test]
    fn prop_expiry_is_running_maximum(initial in 0i64..1_000, offers in prop::collection::vec(0i64..10_000, 1..64)) {
        let expiry = MonotonicExpiry::new(initial);
        let mut max = initial;

        for offer in offers {
            let before = expiry.load();
            let outcome = expiry.advance(offer);
            max = max.max(offer);

            prop_assert!(expiry.load() >= before);
            prop_assert_eq!(expiry.load(), max);
            match outcome {
                Advance::Updated(value) => prop_assert!(value == offer && offer > before),
                Advance::Stale(value) => prop_assert!(value == before && offer <= before),
                Advance::Closed => prop_assert!(false, "open expiry reported closed"),
            }
        }
    }

    #[test]
    fn prop_concurrent_offers_keep_maximum(offers in prop::collection::vec(0i64..1_000_000, 4..128)) {
        let expiry = Arc::new(MonotonicExpiry::new(0));
        let expected = offers.iter().copied().max().unwrap_or(0);

        let handles: Vec<_> = offers
            .chunks(offers.len().div_ceil(4))
            .map(|chunk| {
                let expiry = expiry.clone();
                let chunk = chunk.to_vec();
                thread::spawn(move || {
                    for offer in chunk {
                        expiry.advance(offer);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        prop_assert_eq!(expiry.load(), expected);
    }

    #[test]
    fn prop_closed_expiry_accepts_nothing(offers in prop::collection::vec(0i64..i64::MAX, 1..16)) {
        let expiry = MonotonicExpiry::new(0);
        expiry.close();

        for offer in offers {
            prop_assert_eq!(expiry.advance(offer), Advance::Closed);
        }
        prop_assert_eq!(expiry.load(), CLOSED);
    }
}
