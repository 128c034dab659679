use std::path::Path;
use anyhow::{Context, Result};

/// Ensure directory exists
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {:?}", path))?;
    }
    Ok(())
}

/// Format number with commas
pub fn format_number(n: usize) -> String {
    let s = n.to_string();
    let mut result = String::new();

    for (count, c) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }

    result.chars().rev().collect()
}

/// Memory usage utilities
pub mod memory {
    /// Format bytes as human-readable string
    pub fn format_bytes(bytes: usize) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Seeded random values for stand-in weights
pub mod random {
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    /// Create RNG with fixed seed
    pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(seed)
    }

    /// Generate a vector of values uniformly drawn from `[-scale, scale)`
    pub fn random_vector(size: usize, scale: f32, seed: u64) -> Vec<f32> {
        let mut rng = seeded_rng(seed);
        (0..size).map(|_| rng.gen_range(-scale..scale)).collect()
    }
}

/// Validation utilities for configuration values
pub mod validation {
    use crate::error::{Result, SetupError};
    use std::fmt::Display;

    /// Validate that value is in the closed range `[min, max]`
    pub fn in_range<T: PartialOrd + Display>(value: T, min: T, max: T, name: &str) -> Result<()> {
        if value < min || value > max {
            return Err(SetupError::invalid_config(
                name,
                format!("must be between {} and {}, got {}", min, max, value),
            ));
        }
        Ok(())
    }

    /// Validate that value is positive
    pub fn positive<T: PartialOrd + Default + Display>(value: T, name: &str) -> Result<()> {
        if value <= T::default() {
            return Err(SetupError::invalid_config(
                name,
                format!("must be positive, got {}", value),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(49408), "49,408");
        assert_eq!(format_number(1234567), "1,234,567");
        assert_eq!(format_number(12), "12");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(memory::format_bytes(1024), "1.00 KB");
        assert_eq!(memory::format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(memory::format_bytes(1536), "1.50 KB");
    }

    #[test]
    fn test_random_vector() {
        let v1 = random::random_vector(10, 0.02, 42);
        let v2 = random::random_vector(10, 0.02, 42);
        let v3 = random::random_vector(10, 0.02, 43);

        assert_eq!(v1.len(), 10);
        assert_eq!(v1, v2);
        assert_ne!(v1, v3);
        assert!(v1.iter().all(|v| v.abs() <= 0.02));
    }

    #[test]
    fn test_validation() {
        assert!(validation::in_range(0.5, 0.0, 1.0, "dropout").is_ok());
        assert!(validation::in_range(1.5, 0.0, 1.0, "dropout").is_err());

        assert!(validation::positive(1.0, "lr").is_ok());
        let err = validation::positive(0usize, "lora_rank").unwrap_err();
        assert!(err.to_string().contains("lora_rank"));
    }

    #[test]
    fn test_ensure_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
