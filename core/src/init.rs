//! Parameter initializers.

use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};

use crate::error::TreeError;
use crate::tree::Array;

/// How to fill a freshly created variable.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Initializer {
    #[default]
    Zeros,
    Ones,
    Constant { value: f64 },
    /// Zero-mean normal with the given standard deviation.
    Normal { stddev: f64 },
    /// Uniform over `[low, high)`.
    Uniform { low: f64, high: f64 },
    /// Normal with stddev `1 / sqrt(fan_in)`, where fan-in is the first
    /// dimension of the shape.
    LecunNormal,
}

impl Initializer {
    /// Sample an array of the given shape.
    ///
    /// Fails with `InvalidInitializer` for a negative or non-finite stddev
    /// and for empty or non-finite uniform bounds.
    pub fn sample<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> Result<Array, TreeError> {
        let n: usize = shape.iter().product();
        let data = match *self {
            Initializer::Zeros => return Ok(Array::zeros(shape)),
            Initializer::Ones => return Ok(Array::ones(shape)),
            Initializer::Constant { value } => return Ok(Array::full(shape, value)),
            Initializer::Normal { stddev } => draw(&normal(stddev)?, n, rng),
            Initializer::Uniform { low, high } => {
                if !(low.is_finite() && high.is_finite() && low < high) {
                    return Err(TreeError::InvalidInitializer(format!(
                        "uniform bounds [{}, {}) are empty or not finite",
                        low, high
                    )));
                }
                draw(&Uniform::new(low, high), n, rng)
            }
            Initializer::LecunNormal => {
                let std = 1.0 / (fan_in(shape) as f64).sqrt();
                draw(&normal(std)?, n, rng)
            }
        };
        Ok(Array::from_parts(shape.to_vec(), data))
    }
}

fn normal(stddev: f64) -> Result<Normal<f64>, TreeError> {
    Normal::new(0.0, stddev)
        .map_err(|e| TreeError::InvalidInitializer(format!("normal stddev {}: {}", stddev, e)))
}

fn draw<D, R>(distr: &D, n: usize, rng: &mut R) -> Vec<f64>
where
    D: Distribution<f64>,
    R: Rng + ?Sized,
{
    (0..n).map(|_| distr.sample(rng)).collect()
}

fn fan_in(shape: &[usize]) -> usize {
    shape.first().copied().unwrap_or(1).max(1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn constant_initializers() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(Initializer::Zeros.sample(&[3], &mut rng).unwrap(), Array::zeros(&[3]));
        assert_eq!(Initializer::Ones.sample(&[2, 2], &mut rng).unwrap(), Array::ones(&[2, 2]));
        assert_eq!(
            Initializer::Constant { value: 0.5 }.sample(&[], &mut rng).unwrap(),
            Array::scalar(0.5)
        );
    }

    #[test]
    fn same_seed_same_values() {
        let draw = |seed| {
            Initializer::LecunNormal
                .sample(&[4, 3], &mut StdRng::seed_from_u64(seed))
                .unwrap()
        };
        let (a, b, c) = (draw(7), draw(7), draw(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.shape(), &[4, 3]);
    }

    #[test]
    fn uniform_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = Initializer::Uniform { low: -0.5, high: 0.5 }.sample(&[1000], &mut rng).unwrap();
        assert!(a.data().iter().all(|x| (-0.5..0.5).contains(x)));
    }

    #[test]
    fn normal_has_roughly_requested_spread() {
        let mut rng = StdRng::seed_from_u64(2);
        let a = Initializer::Normal { stddev: 2.0 }.sample(&[4000], &mut rng).unwrap();
        let mean = a.mean();
        let var = a.data().iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / a.len() as f64;
        assert!(mean.abs() < 0.2, "mean = {}", mean);
        assert!((var.sqrt() - 2.0).abs() < 0.2, "std = {}", var.sqrt());
    }

    #[test]
    fn zero_stddev_is_all_zeros() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = Initializer::Normal { stddev: 0.0 }.sample(&[5], &mut rng).unwrap();
        assert_eq!(a, Array::zeros(&[5]));
    }

    #[test]
    fn invalid_parameters_are_errors() {
        let mut rng = StdRng::seed_from_u64(4);
        for init in [
            Initializer::Normal { stddev: -1.0 },
            Initializer::Normal { stddev: f64::NAN },
            Initializer::Uniform { low: 1.0, high: 1.0 },
            Initializer::Uniform { low: 2.0, high: 1.0 },
            Initializer::Uniform { low: 0.0, high: f64::INFINITY },
        ] {
            match init.sample(&[2], &mut rng) {
                Err(TreeError::InvalidInitializer(_)) => {}
                other => panic!("{:?}: expected InvalidInitializer, got {:?}", init, other),
            }
        }
    }

    #[test]
    fn serde_tagged_form() {
        let json = serde_json::to_string(&Initializer::Normal { stddev: 0.1 }).unwrap();
        assert_eq!(json, r#"{"type":"normal","stddev":0.1}"#);
        let back: Initializer = serde_json::from_str(r#"{"type":"lecun_normal"}"#).unwrap();
        assert_eq!(back, Initializer::LecunNormal);
    }
}
