//! Property tests for sequence sharding

use proptest::prelude::*;
use ringforge::ring::ShardLayout;
use ringforge::Tensor;

fn layout_strategy() -> impl Strategy<Value = ShardLayout> {
    prop_oneof![Just(ShardLayout::Contiguous), Just(ShardLayout::Zigzag)]
}

proptest! {
    #[test]
    fn shards_partition_the_sequence(layout in layout_strategy(), world in 1usize..8, blocks in 1usize..12) {
        let seq_len = blocks * layout.divisor(world);
        let mut all = Vec::with_capacity(seq_len);
        for rank in 0..world {
            let positions = layout.positions(seq_len, world, rank).unwrap();
            prop_assert_eq!(positions.len(), seq_len / world);
            prop_assert!(positions.windows(2).all(|w| w[0] < w[1]));
            all.extend(positions);
        }
        all.sort_unstable();
        prop_assert_eq!(all, (0..seq_len).collect::<Vec<_>>());
    }

    #[test]
    fn truncate_yields_a_valid_length(layout in layout_strategy(), world in 1usize..9, seq_len in 0usize..4096) {
        let usable = layout.truncate(seq_len, world);
        prop_assert!(usable <= seq_len);
        prop_assert!(seq_len - usable < layout.divisor(world));
        if usable > 0 {
            prop_assert!(layout.validate(usable, world).is_ok());
        }
    }

    #[test]
    fn unshard_inverts_shard(layout in layout_strategy(), world in 1usize..5, blocks in 1usize..4, seed in any::<u64>()) {
        let seq_len = blocks * layout.divisor(world);
        let full = Tensor::randn(&[1, 2, seq_len, 3], seed);
        let shards: Vec<Tensor> = (0..world)
            .map(|rank| layout.shard(&full, 2, world, rank).unwrap())
            .collect();
        let rebuilt = layout.unshard(&shards, 2).unwrap();
        prop_assert_eq!(rebuilt.max_abs_diff(&full).unwrap(), 0.0);
    }
}
