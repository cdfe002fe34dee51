//! Deterministic bucketing of users into `[0, 1)` for percentage rollouts.
use sha1::{Digest, Sha1};

use crate::{user::AttributeValue, User};

/// `0xFFFFFFFFFFFFFFF`: the largest value representable by 15 hex digits.
const LONG_SCALE: u64 = 0x0FFF_FFFF_FFFF_FFFF;

/// Compute the bucket of `user` for a flag.
///
/// The bucket is derived from the SHA-1 digest of `"{prefix}.{id}"`, where `prefix` is the seed
/// when given and `"{flag_key}.{salt}"` otherwise, and `id` is the value of `attribute` (with
/// `".{secondary}"` appended when the user has a secondary key). The first 15 hex digits of the
/// digest are scaled to a float.
///
/// Users without a usable value for `attribute` always land in bucket `0.0`.
pub fn bucket_user(
    user: &User,
    flag_key: &str,
    attribute: &str,
    salt: &str,
    seed: Option<i64>,
) -> f64 {
    let Some(mut id_hash) = user
        .value_for_evaluation(attribute)
        .as_ref()
        .and_then(bucketable_string)
    else {
        return 0.0;
    };

    if let Some(secondary) = user.secondary() {
        id_hash.push('.');
        id_hash.push_str(secondary);
    }

    let prefix = match seed {
        Some(seed) => seed.to_string(),
        None => format!("{flag_key}.{salt}"),
    };

    let digest = Sha1::digest(format!("{prefix}.{id_hash}").as_bytes());
    // 15 hex digits are the top 60 bits of the first 8 bytes.
    let value = digest[..8]
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
        >> 4;

    value as f64 / LONG_SCALE as f64
}

/// Only strings and integer-valued numbers can be bucketed.
fn bucketable_string(value: &AttributeValue) -> Option<String> {
    match value {
        AttributeValue::String(s) => Some(s.clone()),
        // Integral values outside the i64 range cannot be rendered exactly.
        AttributeValue::Number(n)
            if n.fract() == 0.0 && (i64::MIN as f64..i64::MAX as f64).contains(n) =>
        {
            Some(format!("{}", *n as i64))
        }
        _ => None,
    }
}
