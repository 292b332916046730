//! Validation gate: sanitising and bound-checking of user-supplied fields.
//!
//! Every check is a pure function over a single raw value. A failed check is
//! returned, never raised, and carries a human-readable reason. The text
//! sanitiser is a best-effort filter against script injection, not a full
//! HTML sanitiser.

use std::{collections::BTreeMap, fmt, sync::LazyLock};

use regex::Regex;
use serde::Serialize;

// ─── Limits ──────────────────────────────────────────────────────────────────

pub const MAX_POLLY_DESCRIPTION_LENGTH: usize = 60;
pub const MAX_NAME_LENGTH: usize = 60;
/// Also the limit for driver meeting details.
pub const MAX_COMMENTS_LENGTH: usize = 255;
pub const MAX_SANITIZED_LENGTH: usize = 1000;
pub const MIN_SPOTS: i64 = 1;
pub const MAX_SPOTS: i64 = 50;

// ─── Patterns ────────────────────────────────────────────────────────────────

static UUID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(
    r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[1-5][0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$",
  )
  .expect("valid uuid pattern")
});

static TEXT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r##"^[a-zA-Z0-9\s\-.,!?()@:;'"&%$#*+=/\\\[\]{}|~`]+$"##)
    .expect("valid text pattern")
});

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[a-zA-Z\s\-']+$").expect("valid name pattern")
});

static CONTROL_CHARS: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"[\x00-\x1F\x7F]").expect("valid control pattern")
});

static SCRIPT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"(?is)<script\b.*?</script>").expect("valid script pattern")
});

static JAVASCRIPT_URI: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"(?i)javascript:").expect("valid uri pattern")
});

static EVENT_HANDLER: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"(?i)on\w+\s*=").expect("valid handler pattern")
});

static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"\s{3,}").expect("valid whitespace pattern")
});

// ─── Results ─────────────────────────────────────────────────────────────────

/// Outcome of a single-field check; `Err` holds the reason.
pub type FieldCheck = Result<(), String>;

/// A form field that can fail validation.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Field {
  Id,
  Name,
  Description,
  Spots,
  Comments,
}

impl Field {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Id => "id",
      Self::Name => "name",
      Self::Description => "description",
      Self::Spots => "spots",
      Self::Comments => "comments",
    }
  }
}

impl fmt::Display for Field {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Per-field error map produced by the form combinators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationErrors(BTreeMap<Field, String>);

impl ValidationErrors {
  pub fn new() -> Self { Self::default() }

  /// A map holding a single failure.
  pub fn single(field: Field, message: impl Into<String>) -> Self {
    let mut errors = Self::new();
    errors.insert(field, message);
    errors
  }

  /// Record a failure, replacing any earlier message for `field`.
  pub fn insert(&mut self, field: Field, message: impl Into<String>) {
    self.0.insert(field, message.into());
  }

  /// Record the outcome of a check if it failed.
  pub fn check(&mut self, field: Field, outcome: FieldCheck) {
    if let Err(message) = outcome {
      self.insert(field, message);
    }
  }

  pub fn get(&self, field: Field) -> Option<&str> {
    self.0.get(&field).map(String::as_str)
  }

  pub fn contains(&self, field: Field) -> bool { self.0.contains_key(&field) }

  pub fn is_empty(&self) -> bool { self.0.is_empty() }

  pub fn len(&self) -> usize { self.0.len() }

  pub fn iter(&self) -> impl Iterator<Item = (Field, &str)> {
    self.0.iter().map(|(field, message)| (*field, message.as_str()))
  }

  /// Fold `other` in; its messages win on conflict.
  pub fn extend(&mut self, other: ValidationErrors) { self.0.extend(other.0); }

  /// `Ok` if no field failed.
  pub fn into_result(self) -> Result<(), ValidationErrors> {
    if self.is_empty() { Ok(()) } else { Err(self) }
  }
}

impl fmt::Display for ValidationErrors {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut first = true;
    for (field, message) in self.iter() {
      if !first {
        f.write_str("; ")?;
      }
      write!(f, "{field}: {message}")?;
      first = false;
    }
    Ok(())
  }
}

impl std::error::Error for ValidationErrors {}

// ─── Sanitiser ───────────────────────────────────────────────────────────────

/// Strip control characters and script-injection patterns, collapse long
/// whitespace runs and bound the length.
///
/// Removal is repeated until nothing matches, so stripping one pattern can
/// never splice together a new `<script>` block or `javascript:` token.
pub fn sanitize_text(input: &str) -> String {
  let mut text = CONTROL_CHARS.replace_all(input.trim(), "").into_owned();

  loop {
    let stripped = EVENT_HANDLER.replace_all(
      &JAVASCRIPT_URI.replace_all(&SCRIPT_BLOCK.replace_all(&text, ""), ""),
      "",
    )
    .into_owned();
    if stripped == text {
      break;
    }
    text = stripped;
  }

  WHITESPACE_RUN
    .replace_all(&text, "  ")
    .chars()
    .take(MAX_SANITIZED_LENGTH)
    .collect()
}

// ─── Field validators ────────────────────────────────────────────────────────

/// Canonical 8-4-4-4-12 hex UUID with version 1-5 and RFC 4122 variant.
pub fn validate_uuid(value: &str) -> FieldCheck {
  if UUID_PATTERN.is_match(value) {
    Ok(())
  } else {
    Err("Invalid UUID format".into())
  }
}

fn check_text(
  value: &str,
  label: &str,
  max: usize,
  pattern: &Regex,
  invalid: &str,
) -> FieldCheck {
  let sanitized = sanitize_text(value);
  if sanitized.is_empty() {
    return Err(format!("{label} is required"));
  }
  if sanitized.chars().count() > max {
    return Err(format!("{label} must be {max} characters or less"));
  }
  if !pattern.is_match(&sanitized) {
    return Err(invalid.to_owned());
  }
  Ok(())
}

const NAME_INVALID: &str = "Name contains invalid characters. Only letters, \
                            spaces, hyphens, and apostrophes are allowed";

/// Description of a polly.
pub fn validate_polly_description(value: &str) -> FieldCheck {
  check_text(
    value,
    "Description",
    MAX_POLLY_DESCRIPTION_LENGTH,
    &TEXT_PATTERN,
    "Description contains invalid characters",
  )
}

/// Meeting details of a driver.
pub fn validate_description(value: &str) -> FieldCheck {
  check_text(
    value,
    "Description",
    MAX_COMMENTS_LENGTH,
    &TEXT_PATTERN,
    "Description contains invalid characters",
  )
}

/// Driver or consumer name.
pub fn validate_name(value: &str) -> FieldCheck {
  check_text(value, "Name", MAX_NAME_LENGTH, &NAME_PATTERN, NAME_INVALID)
}

/// Like [`validate_name`], but blank input passes.
pub fn validate_optional_name(value: &str) -> FieldCheck {
  if sanitize_text(value).is_empty() {
    return Ok(());
  }
  validate_name(value)
}

/// Optional free-text comments; blank input passes.
pub fn validate_comments(value: &str) -> FieldCheck {
  if value.trim().is_empty() {
    return Ok(());
  }
  let sanitized = sanitize_text(value);
  if sanitized.chars().count() > MAX_COMMENTS_LENGTH {
    return Err(format!(
      "Comments must be {MAX_COMMENTS_LENGTH} characters or less"
    ));
  }
  if !TEXT_PATTERN.is_match(&sanitized) {
    return Err("Comments contain invalid characters".into());
  }
  Ok(())
}

/// Seat capacity: an integer in `[1, 50]`.
pub fn validate_spots(value: i64) -> FieldCheck {
  if value < MIN_SPOTS {
    return Err(format!("Spots must be at least {MIN_SPOTS}"));
  }
  if value > MAX_SPOTS {
    return Err(format!("Spots cannot exceed {MAX_SPOTS}"));
  }
  Ok(())
}

fn capacity_message(current_consumers: usize) -> String {
  format!(
    "Spots cannot be lower than the current number of passengers \
     ({current_consumers}). Please remove passengers first."
  )
}

// ─── Form combinators ────────────────────────────────────────────────────────

/// All fields of a new driver.
pub fn validate_driver_form(
  name: &str,
  description: &str,
  spots: i64,
) -> Result<(), ValidationErrors> {
  let mut errors = ValidationErrors::new();
  errors.check(Field::Name, validate_name(name));
  errors.check(Field::Description, validate_description(description));
  errors.check(Field::Spots, validate_spots(spots));
  errors.into_result()
}

/// All fields of an edited driver. Seats may not drop below the passengers
/// already assigned.
pub fn validate_driver_update_form(
  name: &str,
  description: &str,
  spots: i64,
  current_consumers: usize,
) -> Result<(), ValidationErrors> {
  validate_driver_patch(
    Some(name),
    Some(description),
    Some(spots),
    current_consumers,
  )
}

/// Only the supplied fields of an edited driver; the capacity rule applies
/// when `spots` is supplied.
pub fn validate_driver_patch(
  name: Option<&str>,
  description: Option<&str>,
  spots: Option<i64>,
  current_consumers: usize,
) -> Result<(), ValidationErrors> {
  let mut errors = ValidationErrors::new();
  if let Some(name) = name {
    errors.check(Field::Name, validate_name(name));
  }
  if let Some(description) = description {
    errors.check(Field::Description, validate_description(description));
  }
  if let Some(spots) = spots {
    errors.check(Field::Spots, validate_spots(spots));
    if spots < current_consumers as i64 {
      errors.insert(Field::Spots, capacity_message(current_consumers));
    }
  }
  errors.into_result()
}

/// A new consumer.
pub fn validate_consumer_form(
  name: &str,
  comments: Option<&str>,
) -> Result<(), ValidationErrors> {
  validate_consumer_patch(Some(name), comments)
}

/// Only the supplied fields of an edited consumer.
pub fn validate_consumer_patch(
  name: Option<&str>,
  comments: Option<&str>,
) -> Result<(), ValidationErrors> {
  let mut errors = ValidationErrors::new();
  if let Some(name) = name {
    errors.check(Field::Name, validate_name(name));
  }
  if let Some(comments) = comments {
    errors.check(Field::Comments, validate_comments(comments));
  }
  errors.into_result()
}

#[cfg(test)]
mod tests {
  use super::*;

  // ── sanitize_text ─────────────────────────────────────────────────────────

  #[test]
  fn sanitize_strips_script_blocks_and_uris() {
    let cases = [
      "hi <script>alert(1)</script> there",
      "<SCRIPT type=\"x\">\nalert(1)\n</SCRIPT>",
      "javascript:alert(1)",
      "JaVaScRiPt:void(0)",
      "<scr<script>x</script>ipt>alert(1)</script>",
      "javajavascript:script:",
      "javaonclick=script:run",
      "java\u{0}script:run",
    ];
    for case in cases {
      let out = sanitize_text(case).to_lowercase();
      assert!(!out.contains("javascript:"), "{case:?} -> {out:?}");
      assert!(
        !(out.contains("<script") && out.contains("</script>")),
        "{case:?} -> {out:?}"
      );
    }
  }

  #[test]
  fn sanitize_strips_event_handlers_and_controls() {
    assert_eq!(sanitize_text("<img onerror =x>"), "<img x>");
    assert_eq!(sanitize_text("a\u{7}b\tc"), "abc");
  }

  #[test]
  fn sanitize_trims_collapses_and_truncates() {
    assert_eq!(sanitize_text("  Friday   Carpool  "), "Friday  Carpool");
    assert_eq!(sanitize_text(&"x".repeat(1500)).len(), 1000);
  }

  // ── validate_uuid ─────────────────────────────────────────────────────────

  #[test]
  fn uuid_accepts_canonical_shapes() {
    for ok in [
      "11111111-1111-4111-8111-111111111111",
      "6F9619FF-8B86-1011-B42D-00C04FC964FF",
      "123e4567-e89b-52d3-a456-426614174000",
    ] {
      assert!(validate_uuid(ok).is_ok(), "{ok}");
    }
  }

  #[test]
  fn uuid_rejects_malformed_input() {
    for bad in [
      "",
      "111111111111-4111-8111-111111111111",
      "11111111-1111-4111-8111-11111111111g",
      "11111111-1111-6111-8111-111111111111",
      "11111111-1111-4111-c111-111111111111",
      "11111111-1111-4111-8111-1111111111111",
      " 11111111-1111-4111-8111-111111111111",
    ] {
      assert_eq!(
        validate_uuid(bad),
        Err("Invalid UUID format".to_owned()),
        "{bad:?}"
      );
    }
  }

  // ── text fields ───────────────────────────────────────────────────────────

  #[test]
  fn names_allow_letters_spaces_hyphens_apostrophes() {
    assert!(validate_name("Mary-Jane O'Neil").is_ok());
    assert_eq!(validate_name("   "), Err("Name is required".into()));
    assert!(validate_name("R2D2").is_err());
    assert_eq!(
      validate_name(&"a".repeat(61)),
      Err("Name must be 60 characters or less".into())
    );
  }

  #[test]
  fn optional_name_passes_when_blank() {
    assert!(validate_optional_name("").is_ok());
    assert!(validate_optional_name("Kim").is_ok());
    assert!(validate_optional_name("K1m").is_err());
  }

  #[test]
  fn polly_description_is_bounded_to_sixty() {
    assert!(validate_polly_description("Friday Carpool").is_ok());
    assert!(validate_polly_description(&"a".repeat(60)).is_ok());
    assert!(validate_polly_description(&"a".repeat(61)).is_err());
    assert_eq!(
      validate_polly_description(""),
      Err("Description is required".into())
    );
  }

  #[test]
  fn driver_description_allows_meeting_details() {
    assert!(validate_description("Meet at lot B, 7:30 (sharp!)").is_ok());
    assert!(validate_description(&"a".repeat(255)).is_ok());
    assert!(validate_description(&"a".repeat(256)).is_err());
    assert_eq!(
      validate_description("caf\u{e9}"),
      Err("Description contains invalid characters".into())
    );
  }

  #[test]
  fn comments_are_optional_but_bounded() {
    assert!(validate_comments("").is_ok());
    assert!(validate_comments("   ").is_ok());
    assert!(validate_comments("Bringing a bike").is_ok());
    assert!(validate_comments(&"a".repeat(256)).is_err());
    assert_eq!(
      validate_comments("\u{1f697}"),
      Err("Comments contain invalid characters".into())
    );
  }

  // ── spots ─────────────────────────────────────────────────────────────────

  #[test]
  fn spots_pass_only_between_one_and_fifty() {
    for n in -3..=60 {
      assert_eq!(validate_spots(n).is_ok(), (1..=50).contains(&n), "{n}");
    }
    assert_eq!(validate_spots(0), Err("Spots must be at least 1".into()));
    assert_eq!(validate_spots(51), Err("Spots cannot exceed 50".into()));
  }

  // ── forms ─────────────────────────────────────────────────────────────────

  #[test]
  fn driver_form_collects_every_failure() {
    let errors = validate_driver_form("", "", 0).unwrap_err();
    assert_eq!(errors.len(), 3);
    assert!(errors.contains(Field::Name));
    assert!(errors.contains(Field::Description));
    assert!(errors.contains(Field::Spots));

    assert!(validate_driver_form("Alex", "Meet at lot B", 3).is_ok());
  }

  #[test]
  fn driver_update_rejects_capacity_below_passengers() {
    let errors =
      validate_driver_update_form("Alex", "Meet at lot B", 0, 2).unwrap_err();
    let message = errors.get(Field::Spots).unwrap();
    assert!(message.contains("(2)"), "{message}");
    assert_eq!(errors.len(), 1);

    assert!(validate_driver_update_form("Alex", "Lot B", 2, 2).is_ok());
  }

  #[test]
  fn driver_patch_checks_only_supplied_fields() {
    assert!(validate_driver_patch(None, None, None, 5).is_ok());
    assert!(validate_driver_patch(Some("Alex"), None, None, 5).is_ok());
    let errors = validate_driver_patch(None, None, Some(3), 5).unwrap_err();
    assert!(errors.contains(Field::Spots));
  }

  #[test]
  fn consumer_form_reports_per_field() {
    assert!(validate_consumer_form("Sam", None).is_ok());
    assert!(validate_consumer_form("Sam", Some("")).is_ok());

    let errors =
      validate_consumer_form("Sam 2", Some(&"x".repeat(300))).unwrap_err();
    assert!(errors.contains(Field::Name));
    assert!(errors.contains(Field::Comments));
    assert_eq!(
      errors.to_string(),
      "name: Name contains invalid characters. Only letters, spaces, hyphens, \
       and apostrophes are allowed; comments: Comments must be 255 characters \
       or less"
    );
  }
}
