use chrono::NaiveDate;

pub const FEE_PENDING: &str = "pending";
pub const FEE_PAID: &str = "paid";
pub const FEE_OVERDUE: &str = "overdue";

pub const LOAN_ISSUED: &str = "issued";
pub const LOAN_RETURNED: &str = "returned";

/// Whole calendar days late; on-time and early returns count as zero.
pub fn days_overdue(due_date: NaiveDate, return_date: NaiveDate) -> i64 {
    (return_date - due_date).num_days().max(0)
}

/// Canonical fine formula: days late times the per-day rate, in cents.
/// Never negative.
pub fn fine_cents(due_date: NaiveDate, return_date: NaiveDate, per_day_cents: i64) -> i64 {
    days_overdue(due_date, return_date) * per_day_cents
}

/// Overdue is a read-time derivation, never a stored status. The stored
/// domain is {pending, paid}; a pending fee past its due date reads as
/// overdue without any row mutation.
pub fn fee_status_at<'a>(stored: &'a str, due_date: NaiveDate, as_of: NaiveDate) -> &'a str {
    if stored == FEE_PENDING && due_date < as_of {
        FEE_OVERDUE
    } else {
        stored
    }
}

pub fn loan_is_overdue(stored: &str, due_date: NaiveDate, as_of: NaiveDate) -> bool {
    stored == LOAN_ISSUED && due_date < as_of
}

pub fn letter_grade(percentage: f64) -> &'static str {
    if percentage >= 90.0 {
        "A+"
    } else if percentage >= 80.0 {
        "A"
    } else if percentage >= 70.0 {
        "B+"
    } else if percentage >= 60.0 {
        "B"
    } else if percentage >= 50.0 {
        "C+"
    } else if percentage >= 40.0 {
        "C"
    } else {
        "F"
    }
}
