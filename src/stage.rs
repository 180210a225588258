use crate::command::{Button, CommandSet};
use crate::emulator::Liveness;
use crate::link::{FrameLink, LinkStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("stage {0} does not exist (expected 1-8)")]
    Unknown(u32),
}

/// One of the eight bosses on the stage-select grid, numbered row by row
/// from the top-left, skipping the centre.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage(u8);

impl Stage {
    pub fn from_number(n: u32) -> Result<Self, StageError> {
        match n {
            1..=8 => Ok(Self(n as u8)),
            _ => Err(StageError::Unknown(n)),
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }

    /// Cursor moves from the centre of the grid, in press order
    pub fn moves(self) -> &'static [Button] {
        match self.0 {
            1 => &[Button::Left, Button::Up],
            2 => &[Button::Up],
            3 => &[Button::Right, Button::Up],
            4 => &[Button::Left],
            5 => &[Button::Right],
            6 => &[Button::Left, Button::Down],
            7 => &[Button::Down],
            _ => &[Button::Right, Button::Down],
        }
    }
}

pub struct StageSelect {
    /// Frames each button is held, then released for the same count
    pub hold_frames: usize,
    /// Idle frames after confirming while the stage intro plays
    pub settle_frames: usize,
}

impl Default for StageSelect {
    fn default() -> Self {
        Self {
            hold_frames: 6,
            settle_frames: 11 * 60,
        }
    }
}

impl StageSelect {
    /// Per-frame commands: each move clicked, jump to confirm, then idle
    pub fn script(&self, stage: Stage) -> Vec<CommandSet> {
        let mut script = Vec::new();
        let mut click = |button: Button| {
            for _ in 0..self.hold_frames {
                script.push(CommandSet::empty().with(button));
            }
            for _ in 0..self.hold_frames {
                script.push(CommandSet::empty());
            }
        };
        for &button in stage.moves() {
            click(button);
        }
        click(Button::A);
        script.extend(std::iter::repeat_n(CommandSet::empty(), self.settle_frames));
        script
    }

    /// Play the script in lockstep with frame-ready signals. A command is only
    /// consumed once it has been sent, so timeouts retry the same frame. Stops
    /// early if the emulator exits; returns the link status that ended it.
    pub fn run<L: FrameLink, E: Liveness>(
        &self,
        stage: Stage,
        link: &mut L,
        emulator: &E,
    ) -> LinkStatus<()> {
        tracing::info!(stage = stage.number(), "selecting stage");
        let script = self.script(stage);
        let mut next = 0;
        while let Some(command) = script.get(next) {
            if !emulator.is_running() {
                break;
            }
            match link.next_frame() {
                LinkStatus::Ok(_) => {}
                LinkStatus::Timeout => continue,
                LinkStatus::PeerClosed => return LinkStatus::PeerClosed,
            }
            match link.send_command(command) {
                LinkStatus::Ok(()) => next += 1,
                LinkStatus::Timeout => tracing::debug!(step = next, "stage input send timed out"),
                LinkStatus::PeerClosed => return LinkStatus::PeerClosed,
            }
        }
        LinkStatus::Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::link::ConnectionState;
    use std::collections::VecDeque;

    /// Replays scripted frame and send statuses, then reports healthy frames
    struct ScriptedLink {
        frames: VecDeque<LinkStatus<()>>,
        sends: VecDeque<LinkStatus<()>>,
        sent: Vec<CommandSet>,
    }

    impl ScriptedLink {
        fn new(frames: Vec<LinkStatus<()>>, sends: Vec<LinkStatus<()>>) -> Self {
            Self {
                frames: frames.into(),
                sends: sends.into(),
                sent: Vec::new(),
            }
        }
    }

    impl FrameLink for ScriptedLink {
        fn next_frame(&mut self) -> LinkStatus<Frame> {
            match self.frames.pop_front().unwrap_or(LinkStatus::Ok(())) {
                LinkStatus::Ok(()) => LinkStatus::Ok(Frame::new(image::RgbImage::new(4, 4))),
                LinkStatus::Timeout => LinkStatus::Timeout,
                LinkStatus::PeerClosed => LinkStatus::PeerClosed,
            }
        }

        fn send_command(&mut self, command: &CommandSet) -> LinkStatus<()> {
            let status = self.sends.pop_front().unwrap_or(LinkStatus::Ok(()));
            if status == LinkStatus::Ok(()) {
                self.sent.push(*command);
            }
            status
        }

        fn state(&self) -> ConnectionState {
            ConnectionState::Connected
        }
    }

    struct Alive;

    impl Liveness for Alive {
        fn is_running(&self) -> bool {
            true
        }
    }

    fn quick() -> StageSelect {
        StageSelect {
            hold_frames: 1,
            settle_frames: 1,
        }
    }

    #[test]
    fn rejects_out_of_range_stages() {
        assert_eq!(Stage::from_number(0), Err(StageError::Unknown(0)));
        assert_eq!(Stage::from_number(9), Err(StageError::Unknown(9)));
        assert_eq!(Stage::from_number(8).unwrap().moves(), &[Button::Right, Button::Down]);
    }

    #[test]
    fn script_clicks_moves_then_confirms_then_idles() {
        let select = StageSelect {
            hold_frames: 2,
            settle_frames: 3,
        };
        let script = select.script(Stage::from_number(1).unwrap());
        let left = CommandSet::empty().with(Button::Left);
        let up = CommandSet::empty().with(Button::Up);
        let jump = CommandSet::empty().with(Button::A);
        let idle = CommandSet::empty();
        assert_eq!(
            script,
            [left, left, idle, idle, up, up, idle, idle, jump, jump, idle, idle, idle, idle, idle]
        );
    }

    #[test]
    fn timeouts_do_not_skip_scripted_commands() {
        let select = quick();
        let stage = Stage::from_number(2).unwrap();
        let mut link = ScriptedLink::new(
            vec![LinkStatus::Ok(()), LinkStatus::Ok(()), LinkStatus::Timeout, LinkStatus::Timeout],
            vec![LinkStatus::Ok(()), LinkStatus::Ok(()), LinkStatus::Timeout],
        );
        assert_eq!(select.run(stage, &mut link, &Alive), LinkStatus::Ok(()));
        assert_eq!(link.sent, select.script(stage));
        assert!(link.sent.contains(&CommandSet::empty().with(Button::A)));
    }

    #[test]
    fn peer_close_stops_selection() {
        let select = quick();
        let mut link = ScriptedLink::new(vec![LinkStatus::Ok(()), LinkStatus::PeerClosed], vec![]);
        let status = select.run(Stage::from_number(5).unwrap(), &mut link, &Alive);
        assert_eq!(status, LinkStatus::PeerClosed);
        assert_eq!(link.sent, [CommandSet::empty().with(Button::Right)]);
    }
}
