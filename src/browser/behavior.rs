use rand::Rng;
use std::time::Duration;
use thirtyfour::prelude::*;
use tokio::time::sleep;
use tracing::debug;

/// Split a scroll of `distance` pixels into human-sized steps.
///
/// Steps carry the sign of `distance` and always add up to it exactly.
pub fn scroll_steps<R: Rng>(distance: i64, rng: &mut R) -> Vec<i64> {
    let direction = distance.signum();
    let total = distance.abs();

    let mut steps = Vec::new();
    let mut scrolled = 0;
    while scrolled < total {
        // Random chunk size for each scroll action
        let chunk = rng.gen_range(100..300).min(total - scrolled);
        scrolled += chunk;
        steps.push(chunk * direction);
    }
    steps
}

/// Scroll the page in uneven chunks with short pauses in between
pub async fn human_scroll(driver: &WebDriver, distance: i64) -> WebDriverResult<()> {
    let steps = scroll_steps(distance, &mut rand::thread_rng());

    for step in &steps {
        let behavior = if rand::thread_rng().gen_bool(0.7) { "smooth" } else { "auto" };
        let script = format!(
            "window.scrollBy({{ top: {}, left: 0, behavior: '{}' }});",
            step, behavior
        );
        driver.execute(&script, Vec::new()).await?;

        let pause_ms = rand::thread_rng().gen_range(300..800);
        sleep(Duration::from_millis(pause_ms)).await;
    }

    debug!("Scrolled {} pixels in {} steps", distance, steps.len());
    Ok(())
}
