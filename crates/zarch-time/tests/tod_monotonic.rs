use proptest::prelude::*;
use zarch_time::{FakeHostClock, HostClock, TodClock, TodClockConfig};

proptest! {
    #[test]
    fn stores_never_repeat(steps in proptest::collection::vec(0u64..5_000, 1..64)) {
        let clock = FakeHostClock::new(0);
        let mut tod = TodClock::new(TodClockConfig { initial_tod: 42 });
        let mut last = None;
        for step in steps {
            clock.advance_ns(step);
            let value = tod.store(clock.now_ns());
            if let Some(prev) = last {
                prop_assert!(value > prev);
            }
            last = Some(value);
        }
    }
}

#[test]
fn read_tracks_host_time() {
    let clock = FakeHostClock::new(0);
    let tod = TodClock::new(TodClockConfig::default());
    clock.advance_ns(3_000);
    assert_eq!(tod.read(clock.now_ns()), 3 << 12);
}
