//! Client identity: DUID and IA identifiers.

/// Identity material for one client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub duid: Vec<u8>,
    /// IAID used for IA_NA options.
    pub iaid: u32,
    /// IAID used for IA_PD options.
    pub pd_iaid: u32,
}

impl ClientIdentity {
    /// Perturbs the DUID (adds one to its last byte), used to simulate
    /// a client renewing under a different identity.
    pub fn bump_duid(&mut self) {
        if let Some(last) = self.duid.last_mut() {
            *last = last.wrapping_add(1);
        }
    }
}

/// Deterministic identity source: the same seed and index always yield
/// the same DUID/IAID pair, which keeps exchange tests reproducible.
#[derive(Debug, Clone)]
pub struct IdentityGenerator {
    seed: u64,
}

impl IdentityGenerator {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn identity(&self, index: usize) -> ClientIdentity {
        let mac = mac_for(index as u64, self.seed);
        let iaid = iaid_for(index as u64, self.seed);
        let stamp = duid_time(index as u64, self.seed);

        // DUID-LLT: type 1, hardware type 1 (ethernet), time, then MAC
        let mut duid = vec![0x00, 0x01, 0x00, 0x01];
        duid.extend_from_slice(&stamp.to_be_bytes());
        duid.extend_from_slice(&mac);

        ClientIdentity {
            duid,
            iaid,
            // a PD association never shares the NA identifier
            pd_iaid: !iaid,
        }
    }
}

fn mac_for(index: u64, seed: u64) -> [u8; 6] {
    let mixed = index.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ seed.rotate_left(17);
    [
        0x02, // locally administered, unicast
        ((mixed >> 32) & 0xff) as u8,
        ((mixed >> 24) & 0xff) as u8,
        ((mixed >> 16) & 0xff) as u8,
        ((mixed >> 8) & 0xff) as u8,
        (mixed & 0xff) as u8,
    ]
}

fn iaid_for(index: u64, seed: u64) -> u32 {
    let value = (index as u32).wrapping_add(1) ^ (seed as u32).rotate_left(9);
    if value == 0 { 1 } else { value }
}

fn duid_time(index: u64, seed: u64) -> u32 {
    (index.wrapping_mul(0x517C_C1B7_2722_0A95) ^ seed) as u32
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::IdentityGenerator;

    #[test]
    fn deterministic_for_same_seed() {
        let gen_a = IdentityGenerator::new(42);
        let gen_b = IdentityGenerator::new(42);

        let id_a = gen_a.identity(12);
        let id_b = gen_b.identity(12);

        assert_eq!(id_a.duid, id_b.duid);
        assert_eq!(id_a.iaid, id_b.iaid);
    }

    #[test]
    fn duid_is_llt_shaped() {
        let id = IdentityGenerator::new(1).identity(0);
        assert_eq!(&id.duid[..4], &[0x00, 0x01, 0x00, 0x01]);
        assert_eq!(id.duid.len(), 4 + 4 + 6);
    }

    #[test]
    fn na_and_pd_iaids_differ() {
        let id = IdentityGenerator::new(3).identity(5);
        assert_ne!(id.iaid, id.pd_iaid);
    }

    #[test]
    fn unique_duid_for_first_thousand() {
        let generator = IdentityGenerator::new(7);
        let mut seen = HashSet::new();

        for i in 0..1000 {
            let id = generator.identity(i);
            assert!(seen.insert(id.duid), "duplicate duid for index {i}");
        }
    }

    #[test]
    fn bump_duid_changes_identity() {
        let mut id = IdentityGenerator::new(9).identity(0);
        let original = id.duid.clone();
        id.bump_duid();
        assert_ne!(id.duid, original);
        assert_eq!(id.duid.len(), original.len());
    }
}
