//! Employee metadata entered at enrollment, and its validation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Departments offered by the enrollment form.
pub const DEPARTMENTS: [&str; 6] = [
    "Engineering",
    "HR",
    "Sales",
    "Marketing",
    "Finance",
    "Operations",
];

/// Employee record fields collected alongside the face samples.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EmployeeMetadata {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub employee_id: String,
    pub department: String,
    pub position: String,
}

impl EmployeeMetadata {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
    }
}

/// A form field that can fail validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    FirstName,
    LastName,
    Email,
    EmployeeId,
    Department,
    Position,
    Samples,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::FirstName => "firstName",
            Field::LastName => "lastName",
            Field::Email => "email",
            Field::EmployeeId => "employeeId",
            Field::Department => "department",
            Field::Position => "position",
            Field::Samples => "samples",
        }
    }
}

/// Every violated field with its message. Empty means valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<Field, String>);

impl FieldErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        self.0.get(&field).map(String::as_str)
    }

    pub fn contains(&self, field: Field) -> bool {
        self.0.contains_key(&field)
    }

    fn insert(&mut self, field: Field, message: impl Into<String>) {
        self.0.insert(field, message.into());
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (field, message)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {message}", field.as_str())?;
        }
        Ok(())
    }
}

/// Validate the form and the sample count together, collecting every failure.
pub fn validate(metadata: &EmployeeMetadata, sample_count: usize, min_samples: usize) -> FieldErrors {
    let mut errors = FieldErrors::default();

    if metadata.first_name.trim().is_empty() {
        errors.insert(Field::FirstName, "First name is required");
    }
    if metadata.last_name.trim().is_empty() {
        errors.insert(Field::LastName, "Last name is required");
    }
    let email = metadata.email.trim();
    if email.is_empty() {
        errors.insert(Field::Email, "Email is required");
    } else if !looks_like_email(email) {
        errors.insert(Field::Email, "Email is invalid");
    }
    if metadata.employee_id.trim().is_empty() {
        errors.insert(Field::EmployeeId, "Employee ID is required");
    }
    let department = metadata.department.trim();
    if department.is_empty() {
        errors.insert(Field::Department, "Department is required");
    } else if !DEPARTMENTS.contains(&department) {
        errors.insert(Field::Department, "Unknown department");
    }
    if metadata.position.trim().is_empty() {
        errors.insert(Field::Position, "Position is required");
    }
    if sample_count < min_samples {
        errors.insert(
            Field::Samples,
            format!("Please capture at least {min_samples} photos for accurate recognition"),
        );
    }

    errors
}

/// `local@domain.tld` with no whitespace and non-empty parts.
fn looks_like_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    match domain.rsplit_once('.') {
        Some((host, tld)) => !local.is_empty() && !host.is_empty() && !tld.is_empty(),
        None => false,
    }
}

#[cfg(test)]
pub(crate) fn valid_metadata() -> EmployeeMetadata {
    EmployeeMetadata {
        first_name: "Ada".into(),
        last_name: "Lovelace".into(),
        email: "ada@example.com".into(),
        employee_id: "EMP001".into(),
        department: "Engineering".into(),
        position: "Analyst".into(),
    }
}
