//! Rolling-reload batch math.
//!
//! The server tags each push with `connectionNum|totalConnections`. From
//! that and the configured batch percentage, every connected process
//! derives the same batch assignment independently, so reloads stagger
//! without coordination.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RollingError {
    #[error("malformed batch info: {0}")]
    Malformed(String),

    #[error("connection number {num} out of range for {total} connections")]
    OutOfRange { num: u16, total: u16 },
}

/// Parse a push message into `(batch_num, total_batches)`.
///
/// A message without a `|` separator carries no batch info (the legacy
/// "env changed" signal) and returns `None`: notify everyone immediately.
pub fn batch_info(
    message: &str,
    rolling_pct: u8,
) -> Result<Option<(u16, u16)>, RollingError> {
    let message = message.trim();
    let (num_part, total_part) = match message.split_once('|') {
        Some(parts) => parts,
        None => return Ok(None),
    };

    let connection_num: u16 = num_part
        .parse()
        .map_err(|_| RollingError::Malformed(message.to_string()))?;
    let total: u16 = total_part
        .parse()
        .map_err(|_| RollingError::Malformed(message.to_string()))?;

    if total == 0 || connection_num >= total {
        return Err(RollingError::OutOfRange {
            num: connection_num,
            total,
        });
    }

    let pct = u32::from(rolling_pct.clamp(1, 100));
    let total_u32 = u32::from(total);

    let batch_size = (pct * total_u32 / 100).max(1);
    let max_batches = (100 + pct - 1) / pct;
    let total_batches = max_batches.min(total_u32.div_ceil(batch_size));

    // Sequential assignment; the remainder goes to the earliest batches.
    let base = total_u32 / total_batches;
    let remainder = total_u32 % total_batches;
    let big = base + 1;
    let num = u32::from(connection_num);

    let batch_num = if num < remainder * big {
        num / big
    } else {
        remainder + (num - remainder * big) / base
    };

    Ok(Some((batch_num as u16, total_batches as u16)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(message: &str, pct: u8) -> (u16, u16) {
        batch_info(message, pct).unwrap().unwrap()
    }

    #[test]
    fn test_batch_info_table_at_25_pct() {
        // (message, expected batch, expected total batches)
        let table = [
            ("0|1", 0, 1),
            ("0|2", 0, 2),
            ("1|2", 1, 2),
            ("0|3", 0, 3),
            ("1|3", 1, 3),
            ("2|3", 2, 3),
            ("0|4", 0, 4),
            ("1|4", 1, 4),
            ("2|4", 2, 4),
            ("3|4", 3, 4),
            ("0|5", 0, 4),
            ("1|5", 0, 4),
            ("2|5", 1, 4),
            ("3|5", 2, 4),
            ("4|5", 3, 4),
            ("0|6", 0, 4),
            ("1|6", 0, 4),
            ("2|6", 1, 4),
            ("3|6", 1, 4),
            ("4|6", 2, 4),
            ("5|6", 3, 4),
            ("0|8", 0, 4),
            ("1|8", 0, 4),
            ("2|8", 1, 4),
            ("3|8", 1, 4),
            ("4|8", 2, 4),
            ("5|8", 2, 4),
            ("6|8", 3, 4),
            ("7|8", 3, 4),
        ];

        for (message, batch, total) in table {
            assert_eq!(info(message, 25), (batch, total), "message {message}");
        }
    }

    #[test]
    fn test_batch_info_bounds_hold_across_inputs() {
        for pct in 1..=100u8 {
            for total in 1..=64u16 {
                for num in 0..total {
                    let (batch, total_batches) =
                        info(&format!("{num}|{total}"), pct);
                    assert!(batch < total_batches);

                    let batch_size =
                        ((u32::from(pct) * u32::from(total)) / 100).max(1);
                    let cap = (u32::from(total).div_ceil(batch_size))
                        .min((100u32).div_ceil(u32::from(pct)));
                    assert!(u32::from(total_batches) <= cap);
                }
            }
        }
    }

    #[test]
    fn test_assignment_is_stable() {
        let first = info("3|8", 25);
        for _ in 0..10 {
            assert_eq!(info("3|8", 25), first);
        }
    }

    #[test]
    fn test_no_separator_means_no_batch_info() {
        assert_eq!(batch_info("", 25), Ok(None));
        assert_eq!(batch_info("legacy-env-changed", 25), Ok(None));
    }

    #[test]
    fn test_malformed_and_out_of_range() {
        assert!(matches!(
            batch_info("a|b", 25),
            Err(RollingError::Malformed(_))
        ));
        assert!(matches!(
            batch_info("5|5", 25),
            Err(RollingError::OutOfRange { .. })
        ));
        assert!(matches!(
            batch_info("0|0", 25),
            Err(RollingError::OutOfRange { .. })
        ));
    }
}
