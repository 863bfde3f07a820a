use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::Result;
use crate::tensor::{Float, Tensor};

/// He/Kaiming normal initialization: every value drawn from
/// `N(0, sqrt(2 / fan_in))`.
pub fn kaiming_normal<R: Rng + ?Sized>(dims: &[usize], fan_in: usize, rng: &mut R) -> Result<Tensor> {
    let mut t = Tensor::zeros(dims)?;
    let std_dev = (2.0 / fan_in.max(1) as Float).sqrt();
    for v in t.data_mut() {
        *v = std_dev * rng.sample::<Float, _>(StandardNormal);
    }
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn spread_follows_fan_in() {
        let mut rng = StdRng::seed_from_u64(7);
        let t = kaiming_normal(&[200, 50], 50, &mut rng).unwrap();
        let std = t.std();
        let expected = (2.0f64 / 50.0).sqrt();
        assert!((std - expected).abs() < 0.1 * expected, "std {std}");
        assert!(t.mean().abs() < 0.01);
        assert!(t.grad().iter().all(|&g| g == 0.0));
    }
}
