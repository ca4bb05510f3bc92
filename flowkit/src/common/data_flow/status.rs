// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Mutex;

use super::{FlowError, State};
use crate::util::dropkick::Dropkick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowFlags {
  pub state: State,
  pub opened: bool,
  pub opening: bool,
  pub reading: bool,
  pub writing: bool,
  pub read_closed: bool,
  pub write_closing: bool,
  pub write_closed: bool,
}

impl Default for FlowFlags {
  fn default() -> Self {
    Self {
      state: State::Closed,
      opened: false,
      opening: false,
      reading: false,
      writing: false,
      read_closed: false,
      write_closing: false,
      write_closed: false,
    }
  }
}

impl FlowFlags {
  fn settle(&mut self) {
    if self.read_closed && self.write_closed {
      self.state = State::Closed;
    } else if self.state == State::Closing && !self.write_closing {
      self.state = State::Established;
    }
  }
}

/// Status shared by a layer's in-flight operations.
///
/// `begin_*` checks that the operation is valid and marks it in flight; the returned
/// guard clears the marker when dropped, whether the operation finished or its future
/// was dropped. The lock is never held across an await.
#[derive(Debug, Default)]
pub(crate) struct FlowStatus {
  flags: Mutex<FlowFlags>,
}

impl FlowStatus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Status of a flow whose connection is already up
  pub fn established() -> Self {
    Self {
      flags: Mutex::new(FlowFlags {
        state: State::Established,
        opened: true,
        ..FlowFlags::default()
      }),
    }
  }

  fn update<R>(&self, f: impl FnOnce(&mut FlowFlags) -> R) -> R {
    let mut flags = self.flags.lock().expect("Mutex poisoned");
    f(&mut flags)
  }

  pub fn snapshot(&self) -> FlowFlags {
    self.update(|flags| *flags)
  }

  pub fn state(&self) -> State {
    self.update(|flags| flags.state)
  }

  pub fn begin_open(&self) -> Result<Dropkick<impl FnOnce() + '_>, FlowError> {
    self.update(|flags| {
      if flags.opened || flags.state != State::Closed {
        return Err(FlowError::InvalidState(flags.state));
      }
      flags.opened = true;
      flags.opening = true;
      flags.state = State::Opening;
      Ok(())
    })?;
    Ok(Dropkick::callback(move || {
      self.update(|flags| {
        flags.opening = false;
        // An open which neither succeeded nor failed was cancelled
        if flags.state == State::Opening {
          flags.state = State::Error;
        }
      })
    }))
  }

  pub fn open_succeeded(&self) {
    self.update(|flags| {
      if flags.state == State::Opening {
        flags.state = State::Established;
      }
    })
  }

  pub fn begin_read(&self) -> Result<Dropkick<impl FnOnce() + '_>, FlowError> {
    self.update(|flags| {
      if flags.reading {
        return Err(FlowError::ReadInProgress);
      }
      if flags.read_closed {
        return Err(FlowError::ReadClosed);
      }
      if !matches!(flags.state, State::Established | State::Closing) {
        return Err(FlowError::InvalidState(flags.state));
      }
      flags.reading = true;
      Ok(())
    })?;
    Ok(Dropkick::callback(move || {
      self.update(|flags| flags.reading = false)
    }))
  }

  /// Records a completed read; an empty read closes the read side
  pub fn finish_read(&self, end_of_stream: bool) {
    if end_of_stream {
      self.update(|flags| {
        flags.read_closed = true;
        flags.settle();
      })
    }
  }

  pub fn begin_write(&self) -> Result<Dropkick<impl FnOnce() + '_>, FlowError> {
    self.update(|flags| {
      if flags.writing {
        return Err(FlowError::WriteInProgress);
      }
      if flags.write_closed || flags.write_closing {
        return Err(FlowError::WriteClosed);
      }
      if flags.state != State::Established {
        return Err(FlowError::InvalidState(flags.state));
      }
      flags.writing = true;
      Ok(())
    })?;
    Ok(Dropkick::callback(move || {
      self.update(|flags| flags.writing = false)
    }))
  }

  pub fn begin_close_write(&self) -> Result<Dropkick<impl FnOnce() + '_>, FlowError> {
    self.update(|flags| {
      if flags.writing {
        return Err(FlowError::WriteInProgress);
      }
      if flags.write_closed || flags.write_closing {
        return Err(FlowError::WriteClosed);
      }
      if flags.state != State::Established {
        return Err(FlowError::InvalidState(flags.state));
      }
      flags.write_closing = true;
      if flags.read_closed {
        flags.state = State::Closing;
      }
      Ok(())
    })?;
    Ok(Dropkick::callback(move || {
      self.update(|flags| {
        flags.write_closing = false;
        flags.settle();
      })
    }))
  }

  pub fn finish_close_write(&self) {
    self.update(|flags| {
      flags.write_closed = true;
      flags.write_closing = false;
      flags.settle();
    })
  }

  /// Moves a live flow into [State::Error]
  pub fn fail(&self) {
    self.update(|flags| {
      if flags.state != State::Closed {
        flags.state = State::Error;
      }
    })
  }
}
