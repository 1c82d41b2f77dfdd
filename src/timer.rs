use std::time::Duration;

use rand::Rng;

/// Sample a randomized timeout uniformly from `[min, max)`.
pub fn random_timeout(min: Duration, max: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let delta = rng.gen_range(0..(max - min).as_millis().max(1) as u64);
    min + Duration::from_millis(delta)
}
