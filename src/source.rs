//! Synthetic frame source.
//!
//! Stands where a capture device would: renders an 8-bit test pattern at the
//! configured rate and publishes it into the frame ring. The producer thread
//! exits when the exchange reports that the last receiver is gone; dropped
//! consumers propagate all the way back to the source.

use std::thread::{sleep, Builder};
use std::time::Duration;

use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::ring;
use crate::util::mono_time_ns;

/// Starts the producer thread and hands back the consuming side of its
/// frame ring.
pub fn start(config: &Config) -> Result<ring::Receiver> {
    info!(
        width = config.frame_width,
        height = config.frame_height,
        rate = config.frame_rate,
        "starting frame source"
    );

    let (sender, receiver) = ring::channel(config.frame_size());

    let (width, height, rate) = (config.frame_width, config.frame_height, config.frame_rate);
    Builder::new()
        .name("source".to_string())
        .spawn(move || run(sender, width, height, rate))?;

    Ok(receiver)
}

fn run(mut sender: ring::Sender, width: u32, height: u32, rate: u32) {
    let period = Duration::from_secs(1) / rate.max(1);
    let mut frame = vec![0u8; (width * height) as usize];
    let mut step = 0u64;

    info!("frame source started");
    loop {
        render(&mut frame, width, height, step);
        step += 1;

        if sender.send(&frame, mono_time_ns()).is_err() {
            // All receivers are gone; nobody will ever see another frame.
            break;
        }

        sleep(period);
    }
    info!("frame source closing");
}

/// Draws a diagonal gradient with a bright vertical bar sweeping across it.
fn render(buf: &mut [u8], width: u32, height: u32, step: u64) {
    let bar = ((step * 4) % width.max(1) as u64) as u32;
    for y in 0..height {
        for x in 0..width {
            let i = (y * width + x) as usize;
            buf[i] = if x.abs_diff(bar) < 8 {
                u8::MAX
            } else {
                (x.wrapping_add(y).wrapping_add(step as u32) % 128) as u8
            };
        }
    }
}
