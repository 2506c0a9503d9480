use dagd_consensus::Hash256;
use dagd_primitives::encoding::{decode, encode};
use dagd_primitives::outpoint::OutPoint;
use dagd_primitives::subnetwork::{
    SubnetworkId, SUBNETWORK_ID_COINBASE, SUBNETWORK_ID_NATIVE, SUBNETWORK_ID_REGISTRY,
};
use dagd_primitives::transaction::{Transaction, TxIn, TxOut};
use dagd_primitives::block::{Block, BlockHeader};

struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    fn next_u8(&mut self) -> u8 {
        self.next_u64() as u8
    }

    fn gen_range(&mut self, max: usize) -> usize {
        if max == 0 {
            0
        } else {
            (self.next_u64() % max as u64) as usize
        }
    }
}

fn fill_bytes<const N: usize>(rng: &mut Lcg) -> [u8; N] {
    std::array::from_fn(|_| rng.next_u8())
}

fn random_hash(rng: &mut Lcg) -> Hash256 {
    fill_bytes::<32>(rng)
}

fn random_vec(rng: &mut Lcg, max_len: usize) -> Vec<u8> {
    let len = rng.gen_range(max_len + 1);
    let mut bytes = Vec::with_capacity(len);
    for _ in 0..len {
        bytes.push(rng.next_u8());
    }
    bytes
}

fn random_subnetwork(rng: &mut Lcg) -> SubnetworkId {
    match rng.gen_range(4) {
        0 => SUBNETWORK_ID_NATIVE,
        1 => SUBNETWORK_ID_COINBASE,
        2 => SUBNETWORK_ID_REGISTRY,
        _ => SubnetworkId(fill_bytes::<20>(rng)),
    }
}

fn random_tx(rng: &mut Lcg) -> Transaction {
    let input_count = rng.gen_range(4);
    let output_count = 1 + rng.gen_range(3);
    let payload = random_vec(rng, 40);
    Transaction {
        version: 1,
        inputs: (0..input_count)
            .map(|_| TxIn {
                previous_outpoint: OutPoint::new(random_hash(rng), rng.next_u32() % 16),
                signature_script: random_vec(rng, 72),
                sequence: rng.next_u64(),
            })
            .collect(),
        outputs: (0..output_count)
            .map(|_| TxOut {
                value: rng.next_u64() % 1_000_000,
                script_pub_key: random_vec(rng, 34),
            })
            .collect(),
        lock_time: rng.next_u64() % 2_000_000,
        subnetwork_id: random_subnetwork(rng),
        gas: rng.next_u64() % 1_000,
        payload_hash: random_hash(rng),
        payload,
    }
}

fn random_block(rng: &mut Lcg) -> Block {
    let parent_count = rng.gen_range(4);
    let tx_count = rng.gen_range(5);
    Block {
        header: BlockHeader {
            version: 1,
            parent_hashes: (0..parent_count).map(|_| random_hash(rng)).collect(),
            hash_merkle_root: random_hash(rng),
            accepted_id_merkle_root: random_hash(rng),
            utxo_commitment: random_hash(rng),
            timestamp: (rng.next_u64() % (1 << 45)) as i64,
            bits: rng.next_u32(),
            nonce: rng.next_u64(),
        },
        transactions: (0..tx_count).map(|_| random_tx(rng)).collect(),
    }
}

#[test]
fn transactions_round_trip() {
    let mut rng = Lcg::new(0x5eed);
    for _ in 0..200 {
        let tx = random_tx(&mut rng);
        let bytes = encode(&tx);
        let decoded: Transaction = decode(&bytes).expect("decode transaction");
        assert_eq!(decoded, tx);
    }
}

#[test]
fn blocks_round_trip() {
    let mut rng = Lcg::new(0xb10c);
    for _ in 0..50 {
        let block = random_block(&mut rng);
        let bytes = encode(&block);
        let decoded: Block = decode(&bytes).expect("decode block");
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }
}

#[test]
fn tx_id_is_stable_under_witness_malleation() {
    let mut rng = Lcg::new(0x1dd);
    for _ in 0..100 {
        let tx = random_tx(&mut rng);
        if tx.inputs.is_empty() || tx.subnetwork_id == SUBNETWORK_ID_COINBASE {
            // Coinbase IDs intentionally cover the payload.
            continue;
        }
        let mut malleated = tx.clone();
        malleated.inputs[0].signature_script = random_vec(&mut rng, 72);
        malleated.payload = random_vec(&mut rng, 40);
        assert_eq!(tx.id(), malleated.id());
    }
}
