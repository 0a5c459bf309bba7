use serde::Serialize;

/// Snapshot of the encoder's `-progress` side channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EncoderProgress {
    pub frame: Option<u64>,
    pub out_time_seconds: Option<f64>,
    pub speed: Option<f64>,
    pub finished: bool,
}

/// Accumulates `key=value` lines; each `progress=` line closes a block.
#[derive(Debug, Default)]
pub struct ProgressParser {
    current: EncoderProgress,
}

impl ProgressParser {
    pub fn feed(&mut self, line: &str) -> Option<EncoderProgress> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();
        match key.trim() {
            "frame" => self.current.frame = value.parse().ok(),
            // Both keys carry microseconds; `out_time_ms` is misnamed upstream.
            "out_time_us" | "out_time_ms" => {
                if let Ok(micros) = value.parse::<i64>() {
                    self.current.out_time_seconds = Some(micros.max(0) as f64 / 1_000_000.0);
                }
            }
            "speed" => {
                self.current.speed = value.trim_end_matches('x').trim().parse().ok();
            }
            "progress" => {
                self.current.finished = value == "end";
                return Some(self.current.clone());
            }
            _ => {}
        }
        None
    }
}
