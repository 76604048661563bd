use {
    anyhow::{Result, bail, format_err},
    argon2::{Algorithm, Argon2, Params, Version},
    serde::{Deserialize, Serialize},
    zeroize::Zeroizing,
};

/// Length of the random salt stored next to the encrypted config.
pub const SALT_LEN: usize = 32;

/// Upper bounds for parameters read from the unauthenticated header of a config record.
pub const MAX_MEMORY_KIB: u32 = 4 * 1024 * 1024;
pub const MAX_ITERATIONS: u32 = 64;
pub const MAX_PARALLELISM: u32 = 64;

/// Argon2id cost parameters. Stored with the encrypted config so that a
/// filesystem created with other parameters can still be unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Parameters that make unit tests fast. Never use them for real data.
    #[must_use]
    #[inline]
    pub const fn insecure_for_tests() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }

    /// Checks the parameters against [`MAX_MEMORY_KIB`], [`MAX_ITERATIONS`]
    /// and [`MAX_PARALLELISM`].
    #[inline]
    pub fn check_limits(&self) -> Result<()> {
        if self.memory_kib > MAX_MEMORY_KIB {
            bail!(
                "memory cost {} KiB exceeds the limit of {MAX_MEMORY_KIB} KiB",
                self.memory_kib
            );
        }
        if self.iterations > MAX_ITERATIONS {
            bail!(
                "{} iterations exceed the limit of {MAX_ITERATIONS}",
                self.iterations
            );
        }
        if self.parallelism > MAX_PARALLELISM {
            bail!(
                "parallelism {} exceeds the limit of {MAX_PARALLELISM}",
                self.parallelism
            );
        }
        Ok(())
    }

    /// Derives a key of `len` bytes from `password` and `salt`.
    #[inline]
    pub fn derive(&self, password: &str, salt: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>> {
        self.check_limits()?;
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(len),
        )
        .map_err(|err| format_err!("invalid key derivation parameters: {err}"))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut key = Zeroizing::new(vec![0u8; len]);
        argon2
            .hash_password_into(password.as_bytes(), salt, &mut key)
            .map_err(|err| format_err!("key derivation failed: {err}"))?;
        Ok(key)
    }
}
