use chrono::NaiveDate;

use crate::error::AppError;

pub fn parse_date(date: &str) -> Result<NaiveDate, AppError> {
  NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| AppError::new("INVALID_DATE", "Date must be YYYY-MM-DD"))
}

pub fn ensure_amount_positive(amount: f64) -> Result<(), AppError> {
  if !amount.is_finite() || amount <= 0.0 {
    Err(AppError::new("INVALID_AMOUNT", "Amount must be > 0"))
  } else {
    Ok(())
  }
}

pub fn ensure_name(field: &str, value: &str) -> Result<(), AppError> {
  if value.trim().is_empty() {
    Err(AppError::new("INVALID_NAME", format!("{field} must not be empty")))
  } else {
    Ok(())
  }
}

pub fn ensure_date_range(from: Option<&str>, to: Option<&str>) -> Result<(), AppError> {
  let from = from.map(parse_date).transpose()?;
  let to = to.map(parse_date).transpose()?;
  if let (Some(from), Some(to)) = (from, to) {
    if from > to {
      return Err(AppError::new("INVALID_RANGE", "Start date must not be after end date"));
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dates_must_be_iso() {
    assert!(parse_date("2024-01-05").is_ok());
    assert_eq!(parse_date("05.01.2024").unwrap_err().code(), "INVALID_DATE");
    assert_eq!(parse_date("2024-02-30").unwrap_err().code(), "INVALID_DATE");
  }

  #[test]
  fn amounts_must_be_positive_and_finite() {
    assert!(ensure_amount_positive(0.01).is_ok());
    assert!(ensure_amount_positive(0.0).is_err());
    assert!(ensure_amount_positive(-5.0).is_err());
    assert!(ensure_amount_positive(f64::NAN).is_err());
  }

  #[test]
  fn ranges_are_ordered() {
    assert!(ensure_date_range(Some("2024-01-01"), Some("2024-12-31")).is_ok());
    assert!(ensure_date_range(None, Some("2024-12-31")).is_ok());
    assert_eq!(
      ensure_date_range(Some("2024-02-01"), Some("2024-01-01")).unwrap_err().code(),
      "INVALID_RANGE"
    );
  }
}
