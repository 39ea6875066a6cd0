use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of intent labels the classifier may assign.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EmailCategory {
    Interested,
    #[serde(rename = "Meeting Booked")]
    MeetingBooked,
    #[serde(rename = "Not Interested")]
    NotInterested,
    Spam,
    #[serde(rename = "Out of Office")]
    OutOfOffice,
}

impl EmailCategory {
    pub const ALL: [EmailCategory; 5] = [
        EmailCategory::Interested,
        EmailCategory::MeetingBooked,
        EmailCategory::NotInterested,
        EmailCategory::Spam,
        EmailCategory::OutOfOffice,
    ];

    /// The wire label used in prompts, the search index, and webhooks.
    pub fn label(&self) -> &'static str {
        match self {
            EmailCategory::Interested => "Interested",
            EmailCategory::MeetingBooked => "Meeting Booked",
            EmailCategory::NotInterested => "Not Interested",
            EmailCategory::Spam => "Spam",
            EmailCategory::OutOfOffice => "Out of Office",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.label() == label.trim())
    }
}

impl fmt::Display for EmailCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_round_trip() {
        for category in EmailCategory::ALL {
            assert_eq!(EmailCategory::from_label(category.label()), Some(category));
        }
    }

    #[test]
    fn unknown_label_is_rejected() {
        assert_eq!(EmailCategory::from_label("Maybe Interested"), None);
        assert_eq!(EmailCategory::from_label(""), None);
    }

    #[test]
    fn serde_uses_wire_labels() {
        let json = serde_json::to_string(&EmailCategory::MeetingBooked).unwrap();
        assert_eq!(json, "\"Meeting Booked\"");
        let back: EmailCategory = serde_json::from_str("\"Out of Office\"").unwrap();
        assert_eq!(back, EmailCategory::OutOfOffice);
    }
}
