use rust_decimal::Decimal;

use crate::precheck::PreCheckBalanceRequest;

/// Worst-case cost of the request: input plus the requested output ceiling,
/// both at the input price. Saturates at `Decimal::MAX`.
pub fn estimated_amount(request: &PreCheckBalanceRequest) -> Decimal {
    if request.price_unit.is_zero() {
        return Decimal::ZERO;
    }
    let tokens = Decimal::from(request.input_tokens) + Decimal::from(request.max_tokens.unwrap_or(0));
    tokens
        .checked_mul(request.input_price)
        .and_then(|amount| amount.checked_div(request.price_unit))
        .unwrap_or(Decimal::MAX)
}

pub fn admit(request: &PreCheckBalanceRequest, balance: Decimal, health_check: bool) -> bool {
    health_check || estimated_amount(request) <= balance
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    fn request(input_tokens: u64, max_tokens: Option<u64>) -> PreCheckBalanceRequest {
        PreCheckBalanceRequest {
            input_tokens,
            max_tokens,
            input_price: dec("0.02"),
            output_price: dec("0.04"),
            price_unit: Decimal::ONE_THOUSAND,
        }
    }

    #[test]
    fn estimate_includes_output_ceiling_at_input_price() {
        assert_eq!(estimated_amount(&request(100, Some(50))), dec("0.003"));
        assert_eq!(estimated_amount(&request(100, None)), dec("0.002"));
    }

    #[test]
    fn admits_up_to_balance() {
        assert!(admit(&request(100, Some(50)), Decimal::ONE, false));
        assert!(admit(&request(100, Some(50)), dec("0.003"), false));
        assert!(!admit(&request(100, Some(1000)), dec("0.001"), false));
    }

    #[test]
    fn huge_output_ceiling_does_not_wrap() {
        let req = request(100, Some(u64::MAX));
        assert!(estimated_amount(&req) > Decimal::from(u64::MAX / 1000));
        assert!(!admit(&req, dec("1.00"), false));
    }

    #[test]
    fn overflowing_estimate_saturates() {
        let req = PreCheckBalanceRequest {
            price_unit: dec("0.0000000001"),
            input_price: Decimal::MAX,
            ..request(u64::MAX, Some(u64::MAX))
        };
        assert_eq!(estimated_amount(&req), Decimal::MAX);
        assert!(!admit(&req, dec("1000000"), false));
    }

    #[test]
    fn health_check_always_admitted() {
        assert!(admit(&request(100, Some(1000)), Decimal::ZERO, true));
    }

    #[test]
    fn admission_is_monotonic_in_balance() {
        let req = request(400, Some(600));
        let threshold = estimated_amount(&req);
        for cents in 0..100 {
            let balance = Decimal::new(cents, 2);
            assert_eq!(admit(&req, balance, false), balance >= threshold);
        }
    }
}
