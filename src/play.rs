use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::classes::ClassTable;
use crate::command::CommandSet;
use crate::debounce::ActionDebouncer;
use crate::emulator::{EmulatorConfig, EmulatorProcess, Liveness};
use crate::frame::{Observation, RollingWindow};
use crate::link::{ConnectPolicy, ConnectionState, EmulatorLink, FrameLink, FramePoll, LinkStatus};
use crate::model::{Model, argmax};
use crate::screen::Screen;
use crate::stage::{Stage, StageSelect};

// =============================================================================
// Session Settings
// =============================================================================

pub struct PlayConfig {
    /// Observations per prediction window
    pub time_steps: usize,
    pub addr: String,
    /// Where the emulator writes each frame before signalling
    pub artifact: PathBuf,
    pub connect: ConnectPolicy,
    pub poll: FramePoll,
    pub stage: Option<Stage>,
    pub stage_select: StageSelect,
}

impl Default for PlayConfig {
    fn default() -> Self {
        Self {
            time_steps: 10,
            addr: "127.0.0.1:4321".to_string(),
            artifact: PathBuf::from("/tmp/.platformer-pilot.screen"),
            connect: ConnectPolicy::default(),
            poll: FramePoll::default(),
            stage: None,
            stage_select: StageSelect::default(),
        }
    }
}

// =============================================================================
// Perceive → Decide → Act
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayPhase {
    AwaitingWindow,
    Predicting,
    Dispatching,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    EmulatorExited,
    ConnectionLost,
    OperatorQuit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayOutcome {
    /// Commands dispatched
    pub cycles: u64,
    pub reason: EndReason,
}

pub struct PlayLoop<'a, M: Model> {
    model: &'a M,
    classes: &'a ClassTable,
    debouncer: ActionDebouncer,
    window: RollingWindow,
    phase: PlayPhase,
    pending: Option<CommandSet>,
    cycles: u64,
}

impl<'a, M: Model> PlayLoop<'a, M> {
    pub fn new(model: &'a M, classes: &'a ClassTable, time_steps: usize) -> Self {
        Self {
            model,
            classes,
            debouncer: ActionDebouncer::default(),
            window: RollingWindow::primed(time_steps),
            phase: PlayPhase::AwaitingWindow,
            pending: None,
            cycles: 0,
        }
    }

    pub fn phase(&self) -> PlayPhase {
        self.phase
    }

    /// Run until the emulator exits, the link drops or the operator quits.
    /// None of those is an error; model failures are.
    pub fn run<L, E, S>(&mut self, link: &mut L, emulator: &E, screen: &mut S) -> Result<PlayOutcome>
    where
        L: FrameLink,
        E: Liveness,
        S: Screen,
    {
        let reason = loop {
            if !emulator.is_running() {
                break EndReason::EmulatorExited;
            }
            if link.state() != ConnectionState::Connected {
                break EndReason::ConnectionLost;
            }
            match self.phase {
                PlayPhase::AwaitingWindow => {
                    let frame = match link.next_frame() {
                        LinkStatus::Ok(frame) => frame,
                        LinkStatus::Timeout => continue,
                        LinkStatus::PeerClosed => break EndReason::ConnectionLost,
                    };
                    if screen.show(&frame)? {
                        break EndReason::OperatorQuit;
                    }
                    self.window.push(Observation::from_frame(&frame));
                    if self.window.is_full() {
                        self.phase = PlayPhase::Predicting;
                    }
                }
                PlayPhase::Predicting => {
                    let probs = self.model.predict(&self.window)?;
                    let (class, confidence) =
                        argmax(&probs).context("model produced no class scores")?;
                    let command = self.classes.command(class).with_context(|| {
                        format!("model predicted class {class}, table has {}", self.classes.len())
                    })?;
                    tracing::debug!(
                        "=> {:20.20}: {:06.2}%",
                        self.classes.name(class).unwrap_or("?"),
                        confidence * 100.0
                    );
                    self.pending = Some(command);
                    self.phase = PlayPhase::Dispatching;
                }
                PlayPhase::Dispatching => {
                    let command = self.debouncer.filter(self.pending.take().unwrap_or_default());
                    match link.send_command(&command) {
                        LinkStatus::Ok(()) => self.cycles += 1,
                        LinkStatus::Timeout => tracing::warn!("command send timed out"),
                        LinkStatus::PeerClosed => break EndReason::ConnectionLost,
                    }
                    // stride 1: the next cycle needs exactly one new observation
                    self.window.evict_oldest();
                    self.phase = PlayPhase::AwaitingWindow;
                }
                PlayPhase::Ended => break EndReason::OperatorQuit,
            }
        };
        self.phase = PlayPhase::Ended;
        Ok(PlayOutcome {
            cycles: self.cycles,
            reason,
        })
    }
}

// =============================================================================
// Full Session
// =============================================================================

/// Launch the emulator, connect, optionally pick a stage, then play.
pub fn run_session<M: Model, S: Screen>(
    emulator_config: &EmulatorConfig,
    config: &PlayConfig,
    model: &M,
    classes: &ClassTable,
    screen: &mut S,
) -> Result<PlayOutcome> {
    let mut emulator = EmulatorProcess::start(emulator_config)?;
    let mut link = EmulatorLink::new(config.artifact.clone(), config.poll);
    link.connect(&config.addr, &config.connect)
        .context("No link to the emulator, not playing")?;

    if let Some(stage) = config.stage {
        if let LinkStatus::PeerClosed = config.stage_select.run(stage, &mut link, &emulator) {
            tracing::warn!("connection lost during stage selection");
        }
    }

    tracing::info!(time_steps = config.time_steps, "starting play loop");
    let outcome = PlayLoop::new(model, classes, config.time_steps).run(&mut link, &emulator, screen)?;
    screen.close();
    link.close();

    match outcome.reason {
        EndReason::OperatorQuit => tracing::info!("play stopped by operator"),
        EndReason::ConnectionLost => tracing::warn!("connection to emulator lost"),
        EndReason::EmulatorExited => tracing::warn!("emulator exited during play"),
    }
    if emulator.is_running() {
        tracing::warn!("emulator still running, waiting for it to exit");
    }
    let exit = emulator.join();
    tracing::info!(cycles = outcome.cycles, ?exit, "play session finished");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::SpriteConfig;
    use crate::command::Button;
    use crate::frame::Frame;
    use crate::model::FitHistory;
    use crate::{NES_HEIGHT, NES_WIDTH};
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::path::Path;

    struct ScriptedLink {
        script: VecDeque<LinkStatus<Frame>>,
        sent: Vec<CommandSet>,
        state: ConnectionState,
    }

    impl ScriptedLink {
        fn frames(n: usize) -> Self {
            let frame = Frame::new(image::RgbImage::new(NES_WIDTH, NES_HEIGHT));
            Self {
                script: (0..n).map(|_| LinkStatus::Ok(frame.clone())).collect(),
                sent: Vec::new(),
                state: ConnectionState::Connected,
            }
        }
    }

    impl FrameLink for ScriptedLink {
        fn next_frame(&mut self) -> LinkStatus<Frame> {
            match self.script.pop_front() {
                Some(status) => status,
                None => {
                    self.state = ConnectionState::Lost;
                    LinkStatus::PeerClosed
                }
            }
        }

        fn send_command(&mut self, command: &CommandSet) -> LinkStatus<()> {
            self.sent.push(*command);
            LinkStatus::Ok(())
        }

        fn state(&self) -> ConnectionState {
            self.state
        }
    }

    /// Alive for a fixed number of liveness checks
    struct Countdown(Cell<u32>);

    impl Liveness for Countdown {
        fn is_running(&self) -> bool {
            let left = self.0.get();
            self.0.set(left.saturating_sub(1));
            left > 0
        }
    }

    fn forever() -> Countdown {
        Countdown(Cell::new(u32::MAX))
    }

    struct FixedModel {
        class: usize,
        classes: usize,
        windows: RefCell<Vec<usize>>,
    }

    impl Model for FixedModel {
        fn num_classes(&self) -> usize {
            self.classes
        }

        fn predict(&self, window: &RollingWindow) -> Result<Vec<f32>> {
            self.windows.borrow_mut().push(window.len());
            let mut probs = vec![0.0; self.classes];
            probs[self.class] = 1.0;
            Ok(probs)
        }

        fn fit(&mut self, _: &[Observation], _: &[usize], _: usize, _: usize) -> Result<FitHistory> {
            Ok(FitHistory::default())
        }

        fn save(&self, _: &Path) -> Result<()> {
            Ok(())
        }
    }

    struct QuitAfter(usize);

    impl Screen for QuitAfter {
        fn show(&mut self, _: &Frame) -> Result<bool> {
            if self.0 == 0 {
                return Ok(true);
            }
            self.0 -= 1;
            Ok(false)
        }
    }

    fn table() -> ClassTable {
        let yaml = "states:\n  jump: {command: [A]}\n  walk: {command: [right]}\n";
        ClassTable::from_config(&SpriteConfig::from_yaml(yaml).unwrap()).unwrap()
    }

    fn model(class: usize) -> FixedModel {
        FixedModel {
            class,
            classes: 4,
            windows: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn predicts_once_per_frame_with_full_window() {
        let classes = table();
        let model = model(3);
        let mut link = ScriptedLink::frames(5);
        let mut play = PlayLoop::new(&model, &classes, 3);
        let outcome = play
            .run(&mut link, &forever(), &mut QuitAfter(usize::MAX))
            .unwrap();

        assert_eq!(outcome, PlayOutcome { cycles: 5, reason: EndReason::ConnectionLost });
        assert_eq!(*model.windows.borrow(), vec![3; 5]);
        assert_eq!(link.sent, vec![CommandSet::empty().with(Button::Right); 5]);
        assert_eq!(play.phase(), PlayPhase::Ended);
    }

    #[test]
    fn held_jump_is_released_after_threshold() {
        let classes = table();
        let model = model(0);
        let mut link = ScriptedLink::frames(22);
        PlayLoop::new(&model, &classes, 2)
            .run(&mut link, &forever(), &mut QuitAfter(usize::MAX))
            .unwrap();
        let jump = CommandSet::empty().with(Button::A);
        assert!(link.sent[..20].iter().all(|c| *c == jump));
        assert_eq!(link.sent[20], CommandSet::empty());
        assert_eq!(link.sent[21], jump);
    }

    #[test]
    fn operator_quit_ends_loop() {
        let classes = table();
        let model = model(1);
        let mut link = ScriptedLink::frames(10);
        let outcome = PlayLoop::new(&model, &classes, 1)
            .run(&mut link, &forever(), &mut QuitAfter(2))
            .unwrap();
        assert_eq!(outcome.reason, EndReason::OperatorQuit);
        assert_eq!(link.sent.len(), 2);
    }

    #[test]
    fn emulator_exit_ends_loop_and_timeouts_do_not() {
        let classes = table();
        let model = model(1);
        let mut link = ScriptedLink::frames(0);
        link.script.extend([LinkStatus::Timeout, LinkStatus::Timeout]);
        let outcome = PlayLoop::new(&model, &classes, 1)
            .run(&mut link, &Countdown(Cell::new(2)), &mut QuitAfter(usize::MAX))
            .unwrap();
        assert_eq!(outcome.reason, EndReason::EmulatorExited);
        assert_eq!(outcome.cycles, 0);
        assert_eq!(link.state, ConnectionState::Connected);
    }
}
