//! Property tests for the mark-bit transition laws.

use proptest::prelude::*;

use greymark::types::{Address, ObjectReference, WORD_SIZE};
use greymark::{AccessMode, Color, MarkBitmap};

const BASE: usize = 0x1000_0000;

#[derive(Debug, Clone, Copy)]
enum Transition {
    WhiteToGrey,
    GreyToBlack,
    WhiteToBlack,
    BlackToGrey,
}

fn transition_strategy() -> impl Strategy<Value = Transition> {
    prop_oneof![
        Just(Transition::WhiteToGrey),
        Just(Transition::GreyToBlack),
        Just(Transition::WhiteToBlack),
        Just(Transition::BlackToGrey),
    ]
}

fn object_at(word: usize) -> ObjectReference {
    ObjectReference::from_address(Address::from_usize(BASE + word * WORD_SIZE)).unwrap()
}

proptest! {
    /// No sequence of legal transitions produces the impossible color.
    #[test]
    fn impossible_color_is_unreachable(
        ops in proptest::collection::vec(transition_strategy(), 1..64),
        // Objects two words apart so pairs stay disjoint.
        word in (0usize..512).prop_map(|w| w * 2),
    ) {
        let bitmap = MarkBitmap::new(Address::from_usize(BASE), 1024 * 1024);
        let object = object_at(word);
        for op in ops {
            match op {
                Transition::WhiteToGrey => {
                    bitmap.white_to_grey(object, AccessMode::Atomic);
                }
                Transition::GreyToBlack => {
                    bitmap.grey_to_black(object, AccessMode::Atomic);
                }
                Transition::WhiteToBlack => {
                    bitmap.white_to_black(object, AccessMode::Atomic);
                }
                Transition::BlackToGrey => {
                    // Overflow recovery only applies to black objects.
                    if bitmap.is_black(object, AccessMode::Atomic) {
                        bitmap.black_to_grey(object, AccessMode::Atomic);
                    }
                }
            }
            prop_assert!(!bitmap.is_impossible(object, AccessMode::Atomic));
        }
    }

    /// `white_to_black` is exactly the white-to-grey-to-black composition.
    #[test]
    fn white_to_black_composes(
        pre_grey in any::<bool>(),
        word in (0usize..512).prop_map(|w| w * 2),
    ) {
        let composed = MarkBitmap::new(Address::from_usize(BASE), 1024 * 1024);
        let direct = MarkBitmap::new(Address::from_usize(BASE), 1024 * 1024);
        let object = object_at(word);

        if pre_grey {
            composed.white_to_grey(object, AccessMode::Atomic);
            direct.white_to_grey(object, AccessMode::Atomic);
        }

        let a = composed.white_to_grey(object, AccessMode::Atomic)
            && composed.grey_to_black(object, AccessMode::Atomic);
        let b = direct.white_to_black(object, AccessMode::Atomic);

        prop_assert_eq!(a, b);
        prop_assert_eq!(
            composed.color(object, AccessMode::Atomic) == Color::Black,
            direct.color(object, AccessMode::Atomic) == Color::Black
        );
    }

    /// Marking never regresses: once grey or black, an object cannot be
    /// observed white again (black-to-grey is the only sanctioned retreat).
    #[test]
    fn marking_is_monotone(
        ops in proptest::collection::vec(transition_strategy(), 1..32),
        word in (0usize..512).prop_map(|w| w * 2),
    ) {
        let bitmap = MarkBitmap::new(Address::from_usize(BASE), 1024 * 1024);
        let object = object_at(word);
        let mut ever_marked = false;
        for op in ops {
            match op {
                Transition::WhiteToGrey => {
                    if bitmap.white_to_grey(object, AccessMode::Atomic) {
                        ever_marked = true;
                    }
                }
                Transition::GreyToBlack => {
                    bitmap.grey_to_black(object, AccessMode::Atomic);
                }
                Transition::WhiteToBlack => {
                    if bitmap.white_to_black(object, AccessMode::Atomic) {
                        ever_marked = true;
                    }
                }
                Transition::BlackToGrey => {
                    if bitmap.is_black(object, AccessMode::Atomic) {
                        bitmap.black_to_grey(object, AccessMode::Atomic);
                    }
                }
            }
            if ever_marked {
                prop_assert!(!bitmap.is_white(object, AccessMode::Atomic));
            }
        }
    }
}
