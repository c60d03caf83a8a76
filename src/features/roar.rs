use rand::seq::IndexedRandom;
use rand::Rng;

/// Roars shorter than this are rerolled
const MIN_LEN: usize = 9;
/// Roars longer than this are rerolled
const MAX_LEN: usize = 29;

/// Successors of each state; `None` is the start state when used as a key
/// and the end of the roar when drawn as a successor.
fn successors(state: Option<char>) -> &'static [Option<char>] {
    match state {
        None => &[Some('G')],
        Some('G') => &[Some('r'), Some('u')],
        Some('r') => &[Some('r'), Some('r'), Some('g'), Some('a'), Some('o')],
        Some('g') => &[Some('g'), Some('r')],
        Some('a') => &[Some('h')],
        Some('o') => &[Some('o'), Some('o'), Some('u')],
        Some('u') => &[Some('u'), Some('u'), Some('r'), Some('r'), Some('h')],
        Some('h') => &[Some('!'), Some('h')],
        Some('!') => &[None, Some('!')],
        Some(_) => &[None],
    }
}

fn walk_chain<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut roar = String::new();
    let mut state = None;

    while let Some(&Some(next)) = successors(state).choose(rng) {
        roar.push(next);
        state = Some(next);
    }

    roar
}

/// Generate a roar such as `Grrrooouuhh!!`
pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> String {
    loop {
        let candidate = walk_chain(rng);
        if (MIN_LEN..=MAX_LEN).contains(&candidate.len()) {
            return candidate;
        }
    }
}
