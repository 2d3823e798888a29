//! Decimal arithmetic utilities for order sizing.

use rust_decimal::{Decimal, RoundingStrategy};

/// Round `quantity` to the nearest multiple of `step`, breaking ties away
/// from zero, preserving sign.
pub fn quantize_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO || quantity == Decimal::ZERO {
        return quantity;
    }
    let sign = if quantity < Decimal::ZERO {
        -Decimal::ONE
    } else {
        Decimal::ONE
    };
    let steps = (quantity.abs() / step)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    steps * step * sign
}

/// Quantize a target position size: step-align, then drop anything below the
/// venue minimum to zero. A position smaller than `min_size` cannot be held,
/// so the target collapses to flat.
pub fn quantize_target(quantity: Decimal, step: Decimal, min_size: Decimal) -> Decimal {
    let quantized = quantize_to_step(quantity, step);
    if quantized.abs() < min_size {
        Decimal::ZERO
    } else {
        quantized
    }
}

/// Quantize an order quantity: step-align, then bump a non-zero request that
/// fell below `min_size` up to it so the venue accepts the order.
pub fn quantize_order(quantity: Decimal, step: Decimal, min_size: Decimal) -> Decimal {
    if quantity == Decimal::ZERO {
        return Decimal::ZERO;
    }
    let quantized = quantize_to_step(quantity, step);
    if quantized.abs() < min_size {
        let sign = if quantity < Decimal::ZERO {
            -Decimal::ONE
        } else {
            Decimal::ONE
        };
        min_size * sign
    } else {
        quantized
    }
}

/// Round a price to the nearest tick.
pub fn round_to_tick(price: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return price;
    }
    (price / tick_size)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        * tick_size
}

/// Split an absolute order quantity into venue-legal chunks no larger than
/// `max_single`. Returns the full-size chunks followed by the remainder.
pub fn chunk_quantity(quantity_abs: Decimal, max_single: Decimal) -> Vec<Decimal> {
    if max_single <= Decimal::ZERO || quantity_abs <= max_single {
        return vec![quantity_abs];
    }
    let mut chunks = Vec::new();
    let mut remaining = quantity_abs;
    while remaining > max_single {
        chunks.push(max_single);
        remaining -= max_single;
    }
    if remaining > Decimal::ZERO {
        chunks.push(remaining);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_quantize_to_step() {
        assert_eq!(quantize_to_step(dec!(0.075), dec!(0.001)), dec!(0.075));
        assert_eq!(quantize_to_step(dec!(0.0751), dec!(0.001)), dec!(0.075));
        // ties round away from zero
        assert_eq!(quantize_to_step(dec!(0.0755), dec!(0.001)), dec!(0.076));
        assert_eq!(quantize_to_step(dec!(-0.0755), dec!(0.001)), dec!(-0.076));
        assert_eq!(quantize_to_step(dec!(1.5), Decimal::ZERO), dec!(1.5));
    }

    #[test]
    fn test_quantize_target_drops_dust() {
        // Dust rounds to zero steps and stays flat
        assert_eq!(
            quantize_target(dec!(0.0000002), dec!(0.001), dec!(0.001)),
            Decimal::ZERO
        );
        // Below min_size the position cannot be held
        assert_eq!(
            quantize_target(dec!(0.0004), dec!(0.0001), dec!(0.001)),
            Decimal::ZERO
        );
        assert_eq!(quantize_target(dec!(0.075), dec!(0.001), dec!(0.001)), dec!(0.075));
        assert_eq!(quantize_target(dec!(-0.075), dec!(0.001), dec!(0.001)), dec!(-0.075));
    }

    #[test]
    fn test_quantize_order_bumps_to_min() {
        assert_eq!(quantize_order(dec!(0.0004), dec!(0.0001), dec!(0.001)), dec!(0.001));
        assert_eq!(quantize_order(dec!(-0.0004), dec!(0.0001), dec!(0.001)), dec!(-0.001));
        // a non-zero request never quantizes to nothing
        assert_eq!(quantize_order(dec!(0.0001), dec!(0.001), dec!(0.001)), dec!(0.001));
        assert_eq!(quantize_order(Decimal::ZERO, dec!(0.001), dec!(0.001)), Decimal::ZERO);
    }

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(dec!(50123.456), dec!(0.01)), dec!(50123.46));
        assert_eq!(round_to_tick(dec!(50123.455), dec!(0.01)), dec!(50123.46));
    }

    #[test]
    fn test_chunk_quantity() {
        assert_eq!(chunk_quantity(dec!(500), dec!(100)), vec![dec!(100); 5]);
        assert_eq!(
            chunk_quantity(dec!(250), dec!(100)),
            vec![dec!(100), dec!(100), dec!(50)]
        );
        assert_eq!(chunk_quantity(dec!(50), dec!(100)), vec![dec!(50)]);
    }
}
