//! Key negotiation math: 64-bit Diffie-Hellman over freshly generated
//! primes, as mandated by the vendor's eSSP key exchange.

use rand::Rng;

/// Host half of one key negotiation.
///
/// Holds the generator and modulus primes offered to the device and the
/// host's secret exponent. The modulus must be smaller than the generator;
/// generation retries until that holds.
#[derive(Debug)]
pub struct KeyExchange {
    generator: u64,
    modulus: u64,
    secret: u64,
}

impl KeyExchange {
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        let generator = random_prime(rng);
        let mut modulus = random_prime(rng);
        while modulus >= generator {
            modulus = random_prime(rng);
        }
        let secret = rng.gen_range(2..u64::MAX);

        Self {
            generator,
            modulus,
            secret,
        }
    }

    pub fn generator(&self) -> u64 {
        self.generator
    }

    pub fn modulus(&self) -> u64 {
        self.modulus
    }

    /// The inter-key the host sends in REQUEST_KEY_EXCHANGE.
    pub fn host_inter_key(&self) -> u64 {
        mod_pow(self.generator, self.secret, self.modulus)
    }

    /// Combines the device's inter-key into the shared session key.
    pub fn session_key(&self, device_inter_key: u64) -> u64 {
        mod_pow(device_inter_key, self.secret, self.modulus)
    }
}

/// Modular exponentiation with u128 intermediates so u64 operands never
/// overflow.
pub fn mod_pow(base: u64, exponent: u64, modulus: u64) -> u64 {
    if modulus <= 1 {
        return 0;
    }

    let modulus = u128::from(modulus);
    let mut result: u128 = 1;
    let mut base = u128::from(base) % modulus;
    let mut exponent = exponent;

    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result * base % modulus;
        }
        base = base * base % modulus;
        exponent >>= 1;
    }

    result as u64
}

fn random_prime<R: Rng>(rng: &mut R) -> u64 {
    loop {
        // Keep bit 63 clear so modulus comparisons have headroom, set the
        // low bit so the candidate is odd.
        let candidate = rng.gen_range(1u64 << 32..1u64 << 62) | 1;
        if is_prime(candidate) {
            return candidate;
        }
    }
}

/// Deterministic Miller-Rabin, exact for all u64.
fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    for p in [2u64, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37] {
        if n == p {
            return true;
        }
        if n % p == 0 {
            return false;
        }
    }

    let mut d = n - 1;
    let mut r = 0u32;
    while d % 2 == 0 {
        d /= 2;
        r += 1;
    }

    // These witnesses are sufficient for every 64-bit integer.
    'witness: for a in [2u64, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37] {
        let mut x = mod_pow(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 0..r - 1 {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    (u128::from(a) * u128::from(b) % u128::from(m)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mod_pow_small_cases() {
        assert_eq!(mod_pow(2, 10, 1_000_000), 1_024);
        assert_eq!(mod_pow(3, 0, 7), 1);
        assert_eq!(mod_pow(10, 5, 7), 100_000 % 7);
    }

    #[test]
    fn primality_known_values() {
        assert!(is_prime(2));
        assert!(is_prime(97));
        assert!(is_prime(2_147_483_647)); // 2^31 - 1
        assert!(!is_prime(1));
        assert!(!is_prime(561)); // Carmichael number
        assert!(!is_prime(2_147_483_649));
    }

    #[test]
    fn exchange_agrees_on_both_sides() {
        let mut rng = rand::thread_rng();
        let host = KeyExchange::generate(&mut rng);

        // Simulate the device side with its own secret.
        let device_secret = 0xDEAD_BEEF_1234u64;
        let device_inter = mod_pow(host.generator(), device_secret, host.modulus());
        let device_key = mod_pow(host.host_inter_key(), device_secret, host.modulus());

        assert_eq!(host.session_key(device_inter), device_key);
    }

    #[test]
    fn modulus_stays_below_generator() {
        let mut rng = rand::thread_rng();
        for _ in 0..4 {
            let kx = KeyExchange::generate(&mut rng);
            assert!(kx.modulus() < kx.generator());
        }
    }
}
