use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use bellperson::bls::{Bls12, Fr, FrRepr};
use ff::{Field, PrimeField};
use generic_array::sequence::GenericSequence;
use generic_array::typenum::{U11, U2, U4, U8};
use generic_array::GenericArray;
use neptune::poseidon::{Poseidon, PoseidonConstants};
use neptune::Arity;

use storage_proofs_pc2::utils::{fr_read_bytes, fr_write_bytes, NODE_SIZE};
use storage_proofs_pc2::{pc2, MmapLayerReader, Pc2Config, SectorParams};

fn init_logger() {
    let _ = pretty_env_logger::try_init();
}

fn fr(v: u64) -> Fr {
    Fr::from_repr(FrRepr::from(v)).unwrap()
}

fn fr_bytes(fr: &Fr, big_endian: bool) -> Vec<u8> {
    let mut bytes = vec![0u8; NODE_SIZE];
    fr_write_bytes(fr, &mut bytes, big_endian);
    bytes
}

fn read_file(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap_or_else(|_| panic!("missing file {:?}", path))
}

/// Naive recursive reference: fold a level at a time.
fn fold<A: Arity<Fr>>(constants: &PoseidonConstants<Bls12, A>, leaves: Vec<Fr>) -> Fr {
    let arity = A::to_usize();
    let mut level = leaves;
    while level.len() > 1 {
        level = level
            .chunks(arity)
            .map(|group| {
                Poseidon::new_with_preimage(GenericArray::from_slice(group), constants).hash()
            })
            .collect();
    }
    level[0]
}

fn constant_column_hash(constants: &PoseidonConstants<Bls12, U11>, value: Fr) -> Fr {
    let column = GenericArray::<Fr, U11>::generate(|_| value);
    Poseidon::new_with_preimage(&column, constants).hash()
}

fn write_constant_layers(
    dir: &Path,
    num_layers: usize,
    sectors: usize,
    nodes: u64,
    value: Fr,
) -> Vec<Vec<PathBuf>> {
    let bytes = fr_bytes(&value, false);
    (0..num_layers)
        .map(|layer| {
            (0..sectors)
                .map(|sector| {
                    let path = dir.join(format!("layer-{}-{}.dat", layer, sector));
                    let mut file = File::create(&path).unwrap();
                    for _ in 0..nodes {
                        file.write_all(&bytes).unwrap();
                    }
                    path
                })
                .collect()
        })
        .collect()
}

fn write_data_file(path: &Path, nodes: u64, byte: u8) {
    let node = [byte; NODE_SIZE];
    let mut file = File::create(path).unwrap();
    for _ in 0..nodes {
        file.write_all(&node).unwrap();
    }
}

fn test_config(out: &Path, nodes: u64, sectors: usize, partitions: usize) -> Pc2Config {
    let sector = SectorParams {
        num_layers: 11,
        arity: 8,
        num_partitions: partitions,
        discard_rows: 1,
        num_nodes: nodes,
        parallel_sectors: sectors,
    };
    let mut config = Pc2Config::new(sector, out.to_path_buf());
    config.topology.writer_threads = 2;
    config
}

struct Fixture {
    _dir: tempfile::TempDir,
    config: Pc2Config,
    reader: MmapLayerReader,
}

fn constant_fixture(nodes: u64, sectors: usize, partitions: usize, value: Fr) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let layers_dir = dir.path().join("layers");
    std::fs::create_dir(&layers_dir).unwrap();
    let out = dir.path().join("out");

    let config = test_config(&out, nodes, sectors, partitions);
    let paths = write_constant_layers(&layers_dir, 11, sectors, nodes, value);
    let reader =
        MmapLayerReader::open(&paths, config.stream_count, config.batch_size, false).unwrap();

    Fixture {
        _dir: dir,
        config,
        reader,
    }
}

// E1: committed-capacity sectors, constant-1 layers; p_aux must match a
// naive recursive Poseidon reference, and the tree-c leaves must be the
// column hashes.
#[test]
fn test_cc_sector_matches_reference() {
    init_logger();
    let nodes = 512u64;
    let fixture = constant_fixture(nodes, 2, 1, fr(1));
    let output = pc2::<U11, U8, U2, _>(&fixture.config, &fixture.reader).unwrap();

    let column_constants = PoseidonConstants::<Bls12, U11>::new();
    let tree_constants = PoseidonConstants::<Bls12, U8>::new();

    let leaf_c = constant_column_hash(&column_constants, fr(1));
    let root_c = fold(&tree_constants, vec![leaf_c; nodes as usize]);
    let root_r = fold(&tree_constants, vec![fr(1); nodes as usize]);

    assert_eq!(output.comm_c, vec![root_c, root_c]);
    assert_eq!(output.comm_r_last, vec![root_r, root_r]);

    let out = &fixture.config.output_dir;
    for sector in &["000", "001"] {
        let p_aux = read_file(&out.join(sector).join("p_aux"));
        assert_eq!(&p_aux[..32], &fr_bytes(&root_c, false)[..]);
        assert_eq!(&p_aux[32..], &fr_bytes(&root_r, false)[..]);

        // column hash correspondence at the first leaf
        let tree_c = read_file(&out.join(sector).join("sc-02-data-tree-c.dat"));
        assert_eq!(tree_c.len() as u64, (512 + 64 + 8 + 1) * 32);
        assert_eq!(&tree_c[..32], &fr_bytes(&leaf_c, false)[..]);
        // the root terminates the file
        assert_eq!(&tree_c[tree_c.len() - 32..], &fr_bytes(&root_c, false)[..]);

        // tree-r discards the bottom two rows
        let tree_r = read_file(&out.join(sector).join("sc-02-data-tree-r-last.dat"));
        assert_eq!(tree_r.len() as u64, (8 + 1) * 32);
        assert_eq!(&tree_r[tree_r.len() - 32..], &fr_bytes(&root_r, false)[..]);

        // sealed bytes are the unencoded last layer, big-endian
        let sealed = read_file(&out.join(sector).join("sealed-file"));
        assert_eq!(sealed.len() as u64, nodes * 32);
        assert_eq!(&sealed[..32], &fr_bytes(&fr(1), true)[..]);
    }
}

// E2: a data file turns its sector non-CC; the sealed file holds the
// field-added last layer and tree-r reflects the encoded leaves.
#[test]
fn test_data_file_encodes_last_layer() {
    init_logger();
    let nodes = 512u64;
    let mut fixture = constant_fixture(nodes, 2, 1, fr(1));

    let data_path = fixture
        .config
        .output_dir
        .parent()
        .unwrap()
        .join("staged-data");
    write_data_file(&data_path, nodes, 2);
    fixture.config.data_files[1] = Some(data_path);

    let output = pc2::<U11, U8, U2, _>(&fixture.config, &fixture.reader).unwrap();

    let tree_constants = PoseidonConstants::<Bls12, U8>::new();
    let data_fr = fr_read_bytes(&[2u8; NODE_SIZE], false).unwrap();
    let mut encoded = fr(1);
    encoded.add_assign(&data_fr);

    let root_r_cc = fold(&tree_constants, vec![fr(1); nodes as usize]);
    let root_r_encoded = fold(&tree_constants, vec![encoded; nodes as usize]);
    assert_eq!(output.comm_r_last, vec![root_r_cc, root_r_encoded]);

    let out = &fixture.config.output_dir;
    let sealed_cc = read_file(&out.join("000").join("sealed-file"));
    assert_eq!(&sealed_cc[..32], &fr_bytes(&fr(1), true)[..]);
    let sealed_encoded = read_file(&out.join("001").join("sealed-file"));
    assert_eq!(&sealed_encoded[..32], &fr_bytes(&encoded, true)[..]);
    assert_eq!(
        &sealed_encoded[(nodes as usize - 1) * 32..],
        &fr_bytes(&encoded, true)[..]
    );

    let p_aux = read_file(&out.join("001").join("p_aux"));
    assert_eq!(&p_aux[32..], &fr_bytes(&root_r_encoded, false)[..]);
}

// E3: tree-r-only runs zero out comm_c and produce no tree-c or sealed
// files.
#[test]
fn test_tree_r_only() {
    init_logger();
    let nodes = 512u64;
    let mut fixture = constant_fixture(nodes, 2, 1, fr(1));
    fixture.config.tree_r_only = true;

    let output = pc2::<U11, U8, U2, _>(&fixture.config, &fixture.reader).unwrap();

    assert_eq!(output.comm_c, vec![Fr::zero(), Fr::zero()]);

    let tree_constants = PoseidonConstants::<Bls12, U8>::new();
    let root_r = fold(&tree_constants, vec![fr(1); nodes as usize]);
    assert_eq!(output.comm_r_last, vec![root_r, root_r]);

    let out = &fixture.config.output_dir;
    let p_aux = read_file(&out.join("000").join("p_aux"));
    assert_eq!(&p_aux[..32], &[0u8; 32][..]);
    assert_eq!(&p_aux[32..], &fr_bytes(&root_r, false)[..]);

    assert!(!out.join("000").join("sc-02-data-tree-c.dat").exists());
    assert!(!out.join("000").join("sealed-file").exists());
    assert!(out.join("000").join("sc-02-data-tree-r-last.dat").exists());
}

// E4: partition roots are folded into p_aux with a Poseidon of the
// partition arity, and the per-partition files are byte-exact.
#[test]
fn test_multi_partition_roots() {
    init_logger();
    let nodes = 2048u64;
    let fixture = constant_fixture(nodes, 2, 4, fr(1));
    let output = pc2::<U11, U8, U4, _>(&fixture.config, &fixture.reader).unwrap();

    let column_constants = PoseidonConstants::<Bls12, U11>::new();
    let tree_constants = PoseidonConstants::<Bls12, U8>::new();
    let partition_constants = PoseidonConstants::<Bls12, U4>::new();

    // every partition covers 512 identical nodes
    let leaf_c = constant_column_hash(&column_constants, fr(1));
    let part_root_c = fold(&tree_constants, vec![leaf_c; 512]);
    let part_root_r = fold(&tree_constants, vec![fr(1); 512]);
    let root_c = fold(&partition_constants, vec![part_root_c; 4]);
    let root_r = fold(&partition_constants, vec![part_root_r; 4]);

    assert_eq!(output.comm_c, vec![root_c, root_c]);
    assert_eq!(output.comm_r_last, vec![root_r, root_r]);

    let out = &fixture.config.output_dir;
    let p_aux = read_file(&out.join("000").join("p_aux"));
    assert_eq!(&p_aux[..32], &fr_bytes(&root_c, false)[..]);
    assert_eq!(&p_aux[32..], &fr_bytes(&root_r, false)[..]);

    // identical inputs per partition: the partition files must match each
    // other exactly
    let first = read_file(&out.join("000").join("sc-02-data-tree-r-last-0.dat"));
    assert_eq!(first.len() as u64, (8 + 1) * 32);
    for partition in 1..4 {
        let other = read_file(
            &out.join("000")
                .join(format!("sc-02-data-tree-r-last-{}.dat", partition)),
        );
        assert_eq!(first, other);
    }
    assert_eq!(
        &first[first.len() - 32..],
        &fr_bytes(&part_root_r, false)[..]
    );
}

// E5: a single throttled writer with a minimal buffer pool must not
// deadlock, and the outputs stay byte-identical.
#[test]
fn test_backpressure_with_slow_writer() {
    init_logger();
    let nodes = 512u64;

    let baseline = constant_fixture(nodes, 2, 1, fr(1));
    pc2::<U11, U8, U2, _>(&baseline.config, &baseline.reader).unwrap();

    let mut throttled = constant_fixture(nodes, 2, 1, fr(1));
    throttled.config.topology.writer_threads = 1;
    throttled.config.disk_io_batch_size = 2;
    throttled.config.host_batches = 2;
    throttled.config.host_empty_batches = 2;
    pc2::<U11, U8, U2, _>(&throttled.config, &throttled.reader).unwrap();

    for sector in &["000", "001"] {
        for name in &[
            "sc-02-data-tree-c.dat",
            "sc-02-data-tree-r-last.dat",
            "sealed-file",
            "p_aux",
        ] {
            let a = read_file(&baseline.config.output_dir.join(sector).join(name));
            let b = read_file(&throttled.config.output_dir.join(sector).join(name));
            assert_eq!(a, b, "{}/{} differs under backpressure", sector, name);
        }
    }
}

// E6: stream interleaving must be invisible in the output: a run with
// eight streams is byte-identical to a single-stream run.
#[test]
fn test_stream_count_does_not_change_output() {
    init_logger();
    let nodes = 4096u64;

    let single = constant_fixture(nodes, 2, 1, fr(1));
    pc2::<U11, U8, U2, _>(&single.config, &single.reader).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let layers_dir = dir.path().join("layers");
    std::fs::create_dir(&layers_dir).unwrap();
    let mut config = test_config(&dir.path().join("out"), nodes, 2, 1);
    config.stream_count = 8;
    let paths = write_constant_layers(&layers_dir, 11, 2, nodes, fr(1));
    let reader = MmapLayerReader::open(&paths, 8, config.batch_size, false).unwrap();
    pc2::<U11, U8, U2, _>(&config, &reader).unwrap();

    for sector in &["000", "001"] {
        for name in &[
            "sc-02-data-tree-c.dat",
            "sc-02-data-tree-r-last.dat",
            "sealed-file",
            "p_aux",
        ] {
            let a = read_file(&single.config.output_dir.join(sector).join(name));
            let b = read_file(&config.output_dir.join(sector).join(name));
            assert_eq!(a, b, "{}/{} differs across stream counts", sector, name);
        }
    }
}

// Cleanup removes exactly the produced outputs.
#[test]
fn test_cleanup_removes_outputs() {
    init_logger();
    let fixture = constant_fixture(512, 2, 1, fr(1));
    pc2::<U11, U8, U2, _>(&fixture.config, &fixture.reader).unwrap();

    let out = &fixture.config.output_dir;
    assert!(out.join("000").join("p_aux").exists());

    storage_proofs_pc2::cleanup(&fixture.config).unwrap();
    assert!(!out.join("000").join("p_aux").exists());
    assert!(!out.join("000").join("sc-02-data-tree-c.dat").exists());
    assert!(!out.join("001").join("sealed-file").exists());
    assert!(!out.join("000").exists());
}
