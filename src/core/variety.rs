/// Surface clean-up applied to every expanded paragraph.
///
/// Grammar expansion splices fragments together, so the raw output can carry
/// doubled spaces, stray spaces before punctuation, a wrong indefinite
/// article in front of a pooled word, immediately repeated words, or a
/// lower-case sentence start. The pass fixes those and nothing else; it never
/// changes word choice.
#[derive(Debug, Clone, Copy, Default)]
pub struct VarietyPass;

impl VarietyPass {
    pub fn apply(text: &str) -> String {
        let words = Self::fix_articles(Self::drop_stutters(text.split_whitespace().collect()));
        let joined = Self::tighten_punctuation(&words.join(" "));
        Self::capitalize_sentences(&joined)
    }

    /// "the the" → "the". Compared case-insensitively, punctuation excluded,
    /// and only when the first word carries no trailing punctuation.
    fn drop_stutters(words: Vec<&str>) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::with_capacity(words.len());
        for word in words {
            if let Some(&prev) = out.last() {
                let bare_prev = prev.trim_end_matches(|c: char| !c.is_alphanumeric());
                if bare_prev.len() == prev.len()
                    && !bare_prev.is_empty()
                    && bare_prev.eq_ignore_ascii_case(
                        word.trim_end_matches(|c: char| !c.is_alphanumeric()),
                    )
                {
                    out.pop();
                }
            }
            out.push(word);
        }
        out
    }

    fn fix_articles(words: Vec<&str>) -> Vec<String> {
        let mut out: Vec<String> = words.iter().map(|w| w.to_string()).collect();
        for i in 0..out.len().saturating_sub(1) {
            let next_vowel = out[i + 1]
                .trim_start_matches(|c: char| !c.is_alphanumeric())
                .chars()
                .next()
                .map(|c| "aeiouAEIOU".contains(c));
            let Some(vowel) = next_vowel else { continue };
            let replacement = match (out[i].as_str(), vowel) {
                ("a", true) => "an",
                ("A", true) => "An",
                ("an", false) => "a",
                ("An", false) => "A",
                _ => continue,
            };
            out[i] = replacement.to_string();
        }
        out
    }

    fn tighten_punctuation(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            if matches!(c, ',' | '.' | '!' | '?' | ';' | ':') && out.ends_with(' ') {
                out.pop();
            }
            out.push(c);
        }
        out
    }

    /// Upper-case the first letter after `.`, `!` or `?` plus whitespace.
    /// Closing quotes may sit between the mark and the space; a mark glued
    /// to the next character (v1.2) does not end a sentence.
    fn capitalize_sentences(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut at_start = true;
        let mut after_terminal = false;
        for c in text.chars() {
            if at_start && c.is_alphanumeric() {
                out.extend(c.to_uppercase());
                at_start = false;
                continue;
            }
            out.push(c);
            if matches!(c, '.' | '!' | '?') {
                after_terminal = true;
            } else if c.is_whitespace() {
                if after_terminal {
                    at_start = true;
                }
                after_terminal = false;
            } else if !matches!(c, '"' | '\'' | ')') {
                after_terminal = false;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_and_punctuation() {
        assert_eq!(
            VarietyPass::apply("  The  gate opened ,  slowly .\nNothing   followed !"),
            "The gate opened, slowly. Nothing followed!"
        );
    }

    #[test]
    fn fixes_indefinite_articles() {
        assert_eq!(
            VarietyPass::apply("She found a ancient blade and an rusted key."),
            "She found an ancient blade and a rusted key."
        );
        assert_eq!(VarietyPass::apply("A ember glowed."), "An ember glowed.");
    }

    #[test]
    fn removes_stutters_only_within_a_clause() {
        assert_eq!(VarietyPass::apply("the the river"), "The river");
        assert_eq!(VarietyPass::apply("It ended. Ended forever."), "It ended. Ended forever.");
    }

    #[test]
    fn capitalizes_sentence_starts() {
        assert_eq!(
            VarietyPass::apply("kai waited. \"who is there?\" nobody answered."),
            "Kai waited. \"Who is there?\" Nobody answered."
        );
    }

    #[test]
    fn leaves_version_numbers_alone() {
        assert_eq!(VarietyPass::apply("patch v1.2 arrived."), "Patch v1.2 arrived.");
    }

    #[test]
    fn is_idempotent() {
        let once = VarietyPass::apply("a orb hums . the the wind rises");
        assert_eq!(VarietyPass::apply(&once), once);
    }
}
