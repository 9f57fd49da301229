//! Record keys derived from human-readable recipe names.
//!
//! The remote store addresses recipes by file name, so every cache and
//! registry lookup goes through [`derive_key`]. Derivation folds accented
//! Latin letters to ASCII, lowercases, collapses punctuation and whitespace
//! into single dashes and appends [`KEY_SUFFIX`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Suffix appended to every derived key (records are stored as JSON files)
pub const KEY_SUFFIX: &str = ".json";

/// Slug used when a name contains no alphanumeric characters at all
const EMPTY_SLUG: &str = "untitled";

/// Normalized, filename-like identifier for a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    /// Derive a key from a name. Equivalent to [`derive_key`].
    pub fn from_name(name: &str) -> Self {
        derive_key(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Slug without the file suffix
    pub fn stem(&self) -> &str {
        self.0.strip_suffix(KEY_SUFFIX).unwrap_or(&self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive the storage key for a recipe name.
///
/// Pure and idempotent: passing an already-derived key returns it unchanged.
pub fn derive_key(name: &str) -> Key {
    let trimmed = name.trim();
    let base = trimmed.strip_suffix(KEY_SUFFIX).unwrap_or(trimmed);

    let mut slug = String::with_capacity(base.len());
    let mut pending_dash = false;

    for c in base.chars() {
        for folded in fold_char(c).chars() {
            if folded.is_ascii_alphanumeric() {
                if pending_dash && !slug.is_empty() {
                    slug.push('-');
                }
                pending_dash = false;
                slug.push(folded.to_ascii_lowercase());
            } else {
                pending_dash = true;
            }
        }
    }

    if slug.is_empty() {
        slug.push_str(EMPTY_SLUG);
    }
    slug.push_str(KEY_SUFFIX);
    Key(slug)
}

/// Fold a character to its unaccented ASCII spelling.
/// Characters outside the table are returned as-is and later treated as separators
/// unless they are ASCII alphanumerics.
fn fold_char(c: char) -> &'static str {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' | 'Ā' | 'Ă' | 'Ą' => "a",
        'æ' | 'Æ' => "ae",
        'ç' | 'ć' | 'č' | 'Ç' | 'Ć' | 'Č' => "c",
        'ď' | 'đ' | 'Ď' | 'Đ' => "d",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => "e",
        'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ė' | 'Ę' | 'Ě' => "e",
        'ğ' | 'Ğ' => "g",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' | 'ı' => "i",
        'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' | 'Į' | 'İ' => "i",
        'ł' | 'ľ' | 'Ł' | 'Ľ' => "l",
        'ñ' | 'ń' | 'ň' | 'Ñ' | 'Ń' | 'Ň' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' | 'Ō' | 'Ő' => "o",
        'œ' | 'Œ' => "oe",
        'ř' | 'Ř' => "r",
        'ś' | 'š' | 'ş' | 'Ś' | 'Š' | 'Ş' => "s",
        'ß' => "ss",
        'ť' | 'ţ' | 'Ť' | 'Ţ' => "t",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' | 'ų' => "u",
        'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ū' | 'Ů' | 'Ű' | 'Ų' => "u",
        'ý' | 'ÿ' | 'Ý' | 'Ÿ' => "y",
        'ź' | 'ż' | 'ž' | 'Ź' | 'Ż' | 'Ž' => "z",
        '&' => "and",
        _ if c.is_ascii_alphanumeric() => ascii_str(c),
        _ => "-",
    }
}

fn ascii_str(c: char) -> &'static str {
    const TABLE: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    match TABLE.find(c) {
        Some(i) => &TABLE[i..i + 1],
        None => "-",
    }
}
