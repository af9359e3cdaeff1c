//! Spoken numeric challenge.
//!
//! At the start of the liveness phase the user is shown a random 4-digit code
//! and asked to read it aloud. A replayed recording cannot know the code in
//! advance. Transcripts from the speech oracle are normalised (lowercase,
//! spelled-out digits mapped to digits, whitespace and punctuation removed)
//! and compared for exact equality.

use rand::Rng;

pub const CHALLENGE_DIGITS: usize = 4;

/// Spelled-out digits, including the homophones speech recognisers commonly
/// emit when a digit is read in isolation.
const DIGIT_WORDS: &[(&str, char)] = &[
    ("zero", '0'),
    ("oh", '0'),
    ("one", '1'),
    ("two", '2'),
    ("to", '2'),
    ("too", '2'),
    ("three", '3'),
    ("four", '4'),
    ("for", '4'),
    ("five", '5'),
    ("six", '6'),
    ("seven", '7'),
    ("eight", '8'),
    ("nine", '9'),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeState {
    code: String,
    active: bool,
    verified: bool,
}

impl ChallengeState {
    /// Issue a fresh random code.
    pub fn issue() -> Self {
        Self::issue_with(&mut rand::thread_rng())
    }

    pub fn issue_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let low = 10u32.pow(CHALLENGE_DIGITS as u32 - 1);
        let high = 10u32.pow(CHALLENGE_DIGITS as u32);
        Self::with_code(rng.gen_range(low..high).to_string())
    }

    pub fn with_code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            active: true,
            verified: false,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Sticky for the attempt.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Stop accepting transcripts (phase left LIVENESS).
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Check one transcript. Returns the verified flag after the check.
    ///
    /// A mismatch never clears an earlier success; an inactive challenge
    /// ignores transcripts.
    pub fn verify(&mut self, transcript: &str) -> bool {
        if self.verified || !self.active {
            return self.verified;
        }
        let heard = normalize_transcript(transcript);
        if heard == self.code {
            self.verified = true;
            tracing::info!("spoken challenge verified");
        } else {
            tracing::debug!(heard = %heard, "spoken challenge mismatch");
        }
        self.verified
    }
}

/// Lowercase, map digit words to digits, drop whitespace and punctuation.
pub fn normalize_transcript(transcript: &str) -> String {
    let lowered = transcript.to_lowercase();
    let mut out = String::with_capacity(CHALLENGE_DIGITS);

    for token in lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        match DIGIT_WORDS.iter().find(|(word, _)| *word == token) {
            Some((_, digit)) => out.push(*digit),
            None => out.push_str(token),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_spelled_out_digits_verify() {
        let mut c = ChallengeState::with_code("4829");
        assert!(c.verify("four eight two nine"));
        assert!(c.is_verified());
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalize_transcript("Four  EIGHT two nine"), "4829");
        assert_eq!(normalize_transcript("4 8 2 9"), "4829");
        assert_eq!(normalize_transcript("4829."), "4829");
        assert_eq!(normalize_transcript("four, 8, two - nine!"), "4829");
        assert_eq!(normalize_transcript("oh one for seven"), "0147");
    }

    #[test]
    fn test_mismatch_does_not_verify() {
        let mut c = ChallengeState::with_code("4829");
        assert!(!c.verify("four eight two eight"));
        assert!(!c.verify("forty eight twenty nine"));
        assert!(!c.is_verified());
    }

    #[test]
    fn test_verification_is_sticky() {
        let mut c = ChallengeState::with_code("1234");
        assert!(c.verify("one two three four"));
        assert!(c.verify("something else entirely"));
        assert!(c.is_verified());
    }

    #[test]
    fn test_inactive_challenge_ignores_transcripts() {
        let mut c = ChallengeState::with_code("1234");
        c.deactivate();
        assert!(!c.verify("1234"));
    }

    #[test]
    fn test_issued_code_is_four_digits() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let c = ChallengeState::issue_with(&mut rng);
            assert_eq!(c.code().len(), CHALLENGE_DIGITS);
            assert!(c.code().chars().all(|ch| ch.is_ascii_digit()));
            assert!(c.is_active());
            assert!(!c.is_verified());
        }
    }
}
