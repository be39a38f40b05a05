use bellperson::bls::{Bls12, Fr};
use generic_array::GenericArray;
use neptune::poseidon::{Poseidon, PoseidonConstants};
use neptune::Arity;

/// Hash one column: the `ColumnArity` field elements at a node index
/// across all encoding layers.
pub fn hash_column<ColumnArity: Arity<Fr>>(
    constants: &PoseidonConstants<Bls12, ColumnArity>,
    column: &GenericArray<Fr, ColumnArity>,
) -> Fr {
    Poseidon::new_with_preimage(column, constants).hash()
}

/// Hash one arity-sized group of tree nodes into their parent.
pub fn hash_group<TreeArity: Arity<Fr>>(
    constants: &PoseidonConstants<Bls12, TreeArity>,
    group: &[Fr],
) -> Fr {
    debug_assert_eq!(group.len(), TreeArity::to_usize());
    Poseidon::new_with_preimage(GenericArray::<Fr, TreeArity>::from_slice(group), constants).hash()
}

/// Hash a full tree level: `nodes` chunked by the arity into `out`.
pub fn hash_level<TreeArity: Arity<Fr>>(
    constants: &PoseidonConstants<Bls12, TreeArity>,
    nodes: &[Fr],
    out: &mut Vec<Fr>,
) {
    let arity = TreeArity::to_usize();
    debug_assert_eq!(nodes.len() % arity, 0);
    out.clear();
    for group in nodes.chunks(arity) {
        out.push(hash_group(constants, group));
    }
}

/// Reduce `leaves` to the tree root.
pub fn tree_root<TreeArity: Arity<Fr>>(
    constants: &PoseidonConstants<Bls12, TreeArity>,
    leaves: &[Fr],
) -> Fr {
    let mut level = leaves.to_vec();
    let mut next = Vec::new();
    while level.len() > 1 {
        hash_level(constants, &level, &mut next);
        std::mem::swap(&mut level, &mut next);
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ff::Field;
    use generic_array::sequence::GenericSequence;
    use generic_array::typenum::{U11, U8};

    #[test]
    fn test_hash_level_matches_groups() {
        let constants = PoseidonConstants::<Bls12, U8>::new();
        let nodes: Vec<Fr> = (0..64).map(|_| Fr::one()).collect();

        let mut level = Vec::new();
        hash_level(&constants, &nodes, &mut level);
        assert_eq!(level.len(), 8);

        let single = hash_group(&constants, &nodes[..8]);
        assert!(level.iter().all(|h| *h == single));

        let root = tree_root(&constants, &nodes);
        assert_eq!(root, hash_group(&constants, &level));
    }

    #[test]
    fn test_column_hash_is_order_sensitive() {
        let constants = PoseidonConstants::<Bls12, U11>::new();
        let a = GenericArray::<Fr, U11>::generate(|i| {
            if i == 0 {
                Fr::one()
            } else {
                Fr::zero()
            }
        });
        let b = GenericArray::<Fr, U11>::generate(|i| {
            if i == 10 {
                Fr::one()
            } else {
                Fr::zero()
            }
        });
        assert_ne!(hash_column(&constants, &a), hash_column(&constants, &b));
    }
}
