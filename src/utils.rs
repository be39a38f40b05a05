use anyhow::{anyhow, Result};
use bellperson::bls::{Fr, FrRepr};
use ff::{PrimeField, PrimeFieldRepr};
use fr32::bytes_into_fr;

/// Size of a serialized field element.
pub const NODE_SIZE: usize = 32;

/// Decode a field element from `NODE_SIZE` bytes.
///
/// Little-endian is the canonical representation used by the tree files;
/// big-endian is used by sealed data and by readers that report
/// `data_is_big_endian()`.
pub fn fr_read_bytes(bytes: &[u8], big_endian: bool) -> Result<Fr> {
    if big_endian {
        let mut repr = FrRepr::default();
        repr.read_be(bytes)?;
        Fr::from_repr(repr).map_err(|err| anyhow!("bytes are not a field element: {:?}", err))
    } else {
        bytes_into_fr(bytes)
    }
}

/// Encode a field element into exactly `NODE_SIZE` bytes.
pub fn fr_write_bytes(fr: &Fr, out: &mut [u8], big_endian: bool) {
    debug_assert_eq!(out.len(), NODE_SIZE);
    let repr = fr.into_repr();
    if big_endian {
        repr.write_be(&mut out[..]).expect("fixed size write");
    } else {
        repr.write_le(&mut out[..]).expect("fixed size write");
    }
}

pub fn is_power_of(mut n: u64, base: u64) -> bool {
    debug_assert!(base >= 2);
    if n == 0 {
        return false;
    }
    while n % base == 0 {
        n /= base;
    }
    n == 1
}

/// Integer log, assuming `n` is a power of `base`.
pub fn log_base(mut n: u64, base: u64) -> u32 {
    let mut log = 0;
    while n > 1 {
        n /= base;
        log += 1;
    }
    log
}
