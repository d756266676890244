use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;

use sha1::Sha1;
use sha2::digest::DynDigest;
use sha2::Sha256;
use sha2::Sha384;
use sha2::Sha512;

use crate::bag::Bag;
use crate::error::SecurityError;

const BAG_SIZE: usize = 50;
const BORROW_TIMEOUT: Duration = Duration::from_secs(10);
const BORROW_ATTEMPTS: usize = 3;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, strum_macros::Display, strum_macros::EnumString)]
pub enum HashAlgo {
    #[strum(serialize = "SHA1")]
    Sha1,
    #[strum(serialize = "SHA256")]
    Sha256,
    #[strum(serialize = "SHA384")]
    Sha384,
    #[strum(serialize = "SHA512")]
    Sha512,
}

impl HashAlgo {
    pub fn output_len(self) -> usize {
        match self {
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha384 => 48,
            HashAlgo::Sha512 => 64,
        }
    }

    fn new_engine(self) -> Box<dyn DynDigest + Send> {
        match self {
            HashAlgo::Sha1 => Box::new(Sha1::default()),
            HashAlgo::Sha256 => Box::new(Sha256::default()),
            HashAlgo::Sha384 => Box::new(Sha384::default()),
            HashAlgo::Sha512 => Box::new(Sha512::default()),
        }
    }
}

type DigestBag = Bag<Box<dyn DynDigest + Send>>;

fn bag_for(algo: HashAlgo) -> Arc<DigestBag> {
    static BAGS: OnceLock<Mutex<HashMap<HashAlgo, Arc<DigestBag>>>> = OnceLock::new();
    let bags = BAGS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut bags = bags.lock().unwrap();
    Arc::clone(bags.entry(algo).or_insert_with(|| {
        Arc::new(Bag::new((0..BAG_SIZE).map(|_| algo.new_engine())))
    }))
}

/// Hashes `chunks` with a reusable engine from the process-wide bag.
///
/// Borrowing retries up to three times with a 10 second timeout each; a pool
/// exhausted for that long means something upstream leaks engines, and the
/// call gives up rather than queue forever.
pub fn hash(algo: HashAlgo, chunks: &[&[u8]]) -> Result<Vec<u8>, SecurityError> {
    let bag = bag_for(algo);
    let mut engine = None;
    for _ in 0..BORROW_ATTEMPTS {
        if let Some(found) = bag.borrow(BORROW_TIMEOUT) {
            engine = Some(found);
            break;
        }
    }
    let Some(mut engine) = engine else {
        return Err(SecurityError::NoIdleDigest(algo));
    };

    engine.reset();
    for chunk in chunks {
        engine.update(chunk);
    }
    let digest = engine.finalize_reset().to_vec();
    bag.requite(engine);
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_input_hashes_like_contiguous_input() {
        let whole = hash(HashAlgo::Sha256, &[b"hello world"]).unwrap();
        let split = hash(HashAlgo::Sha256, &[b"hello", b" ", b"world"]).unwrap();
        assert_eq!(whole, split);
        assert_eq!(whole.len(), HashAlgo::Sha256.output_len());
    }

    #[test]
    fn engines_are_clean_between_borrows() {
        let first = hash(HashAlgo::Sha1, &[b"state"]).unwrap();
        let _ = hash(HashAlgo::Sha1, &[b"other"]).unwrap();
        let again = hash(HashAlgo::Sha1, &[b"state"]).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn parallel_hashing_stays_within_the_bag() {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                std::thread::spawn(move || {
                    let data = vec![i as u8; 1024];
                    for _ in 0..50 {
                        hash(HashAlgo::Sha512, &[&data]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(bag_for(HashAlgo::Sha512).idle_count(), BAG_SIZE);
    }
}
