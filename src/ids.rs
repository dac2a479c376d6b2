use rand::distr::{Alphanumeric, SampleString};

const ROOM_ID_LEN: usize = 10;
const TOKEN_LEN: usize = 21;

/// Source of room ids and admission tokens.
pub trait IdGenerator: Send + Sync {
    /// Short and URL-safe, used in room paths.
    fn room_id(&self) -> String;

    /// Unguessable; whoever holds it is a member of the room.
    fn token(&self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn room_id(&self) -> String {
        Alphanumeric.sample_string(&mut rand::rng(), ROOM_ID_LEN)
    }

    fn token(&self) -> String {
        Alphanumeric.sample_string(&mut rand::rng(), TOKEN_LEN)
    }
}
