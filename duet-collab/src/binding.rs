//! Glue between a text widget and a [`Session`].
//!
//! ```text
//!  user types ──► Widget ──WidgetEdit──► EditorBinding ──► Session::insert/delete/format
//!                   ▲                                           │
//!                   └── insert_text/delete_text ◄── SessionEvent::DocumentChanged (remote)
//! ```
//!
//! Edits the binding itself writes into the widget must not come back as
//! new local edits: widgets tag them [`EditSource::Api`] and the binding
//! drops them.

use duet_core::{Attributes, Change, RelativePosition};
use std::ops::Range;
use uuid::Uuid;

use crate::awareness::CursorRange;
use crate::session::{Origin, Session, SessionError, SessionEvent, SessionState};
use crate::transport::Transport;

/// A widget selection; `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    pub fn caret(at: usize) -> Self {
        Self { anchor: at, head: at }
    }
}

/// Who caused a widget mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditSource {
    User,
    /// Programmatic, e.g. applied by this binding.
    Api,
}

/// A mutation reported by the widget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetEdit {
    Insert { index: usize, text: String, attributes: Attributes },
    Delete { range: Range<usize> },
    Format { range: Range<usize>, attributes: Attributes },
    Selection(Selection),
}

/// Another user's cursor resolved against the current text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCursor {
    pub peer: Uuid,
    pub name: String,
    pub color: String,
    pub selection: Selection,
}

/// The editing surface.
pub trait Widget {
    fn selection(&self) -> Selection;
    fn set_selection(&mut self, selection: Selection);
    fn insert_text(&mut self, index: usize, text: &str, attributes: &Attributes);
    fn delete_text(&mut self, range: Range<usize>);
    /// `Null` values clear the attribute.
    fn format_text(&mut self, range: Range<usize>, attributes: &Attributes);
    fn set_remote_cursors(&mut self, _cursors: &[RemoteCursor]) {}
}

pub struct EditorBinding<W: Widget> {
    widget: W,
}

impl<W: Widget> EditorBinding<W> {
    pub fn new(widget: W) -> Self {
        Self { widget }
    }

    pub fn widget(&self) -> &W {
        &self.widget
    }

    pub fn widget_mut(&mut self) -> &mut W {
        &mut self.widget
    }

    pub fn into_inner(self) -> W {
        self.widget
    }

    /// Forward a widget mutation into the session.
    pub fn on_widget_edit<T: Transport>(
        &mut self,
        session: &mut Session<T>,
        edit: WidgetEdit,
        source: EditSource,
    ) -> Result<(), SessionError> {
        if source == EditSource::Api {
            log::trace!("Suppressed echo of {edit:?}");
            return Ok(());
        }
        match edit {
            WidgetEdit::Insert { index, text, attributes } => {
                session.insert(index, &text, attributes)?;
            }
            WidgetEdit::Delete { range } => {
                session.delete(range)?;
            }
            WidgetEdit::Format { range, attributes } => {
                session.format(range, attributes)?;
            }
            WidgetEdit::Selection(selection) => {
                let doc = session.document();
                let cursor = CursorRange {
                    anchor: doc.relative_position(selection.anchor),
                    head: doc.relative_position(selection.head),
                };
                session.set_cursor(Some(cursor))?;
            }
        }
        Ok(())
    }

    /// Mirror a session event onto the widget.
    pub fn on_session_event<T: Transport>(&mut self, session: &Session<T>, event: &SessionEvent) {
        match event {
            SessionEvent::DocumentChanged { origin: Origin::Remote(_), changes } => {
                self.apply_changes(changes);
                self.render_cursors(session);
            }
            SessionEvent::AwarenessChanged(_) => self.render_cursors(session),
            SessionEvent::StateChanged(SessionState::Closed) => self.widget.set_remote_cursors(&[]),
            _ => {}
        }
    }

    fn apply_changes(&mut self, changes: &[Change]) {
        let mut selection = self.widget.selection();
        for change in changes {
            match change {
                Change::Insert { index, text, attributes } => {
                    self.widget.insert_text(*index, text, attributes);
                    let len = text.chars().count();
                    selection.anchor = shift_for_insert(selection.anchor, *index, len);
                    selection.head = shift_for_insert(selection.head, *index, len);
                }
                Change::Delete { index, len } => {
                    self.widget.delete_text(*index..*index + *len);
                    selection.anchor = shift_for_delete(selection.anchor, *index, *len);
                    selection.head = shift_for_delete(selection.head, *index, *len);
                }
                Change::Format { index, len, attributes } => {
                    self.widget.format_text(*index..*index + *len, attributes);
                }
            }
        }
        self.widget.set_selection(selection);
    }

    fn render_cursors<T: Transport>(&mut self, session: &Session<T>) {
        let cursors = remote_cursors(session);
        self.widget.set_remote_cursors(&cursors);
    }
}

/// Remote insertions at the caret push it right.
fn shift_for_insert(pos: usize, index: usize, len: usize) -> usize {
    if index <= pos {
        pos + len
    } else {
        pos
    }
}

fn shift_for_delete(pos: usize, index: usize, len: usize) -> usize {
    if pos <= index {
        pos
    } else if pos >= index + len {
        pos - len
    } else {
        index
    }
}

/// Other users' cursors whose anchors resolve in the local replica.
pub fn remote_cursors<T: Transport>(session: &Session<T>) -> Vec<RemoteCursor> {
    let doc = session.document();
    let resolve = |pos: &RelativePosition| doc.absolute_position(pos);
    session
        .awareness()
        .states()
        .into_iter()
        .filter(|(peer, _)| *peer != session.peer_id())
        .filter_map(|(peer, presence)| {
            let cursor = presence.cursor?;
            Some(RemoteCursor {
                peer,
                name: presence.name.clone(),
                color: presence.color.clone(),
                selection: Selection {
                    anchor: resolve(&cursor.anchor)?,
                    head: resolve(&cursor.head)?,
                },
            })
        })
        .collect()
}

/// `(name, color)` of every other user that has announced a name.
pub fn presence_list<T: Transport>(session: &Session<T>) -> Vec<(String, String)> {
    session
        .awareness()
        .states()
        .into_iter()
        .filter(|(peer, p)| *peer != session.peer_id() && !p.name.is_empty())
        .map(|(_, p)| (p.name.clone(), p.color.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::Presence;
    use crate::session::SessionConfig;
    use crate::transport::{LocalHub, LocalTransport, TransportEvent};
    use duet_core::attributes;
    use tokio::sync::mpsc;

    /// Plain-string widget that reports its own programmatic edits, the way
    /// real widgets fire change events for every mutation.
    #[derive(Default)]
    struct FakeWidget {
        text: Vec<char>,
        bold: Vec<bool>,
        selection: Selection,
        cursors: Vec<RemoteCursor>,
        emitted: Vec<(WidgetEdit, EditSource)>,
    }

    impl FakeWidget {
        fn text(&self) -> String {
            self.text.iter().collect()
        }

        /// A user keystroke.
        fn type_text(&mut self, index: usize, text: &str) -> (WidgetEdit, EditSource) {
            for (i, c) in text.chars().enumerate() {
                self.text.insert(index + i, c);
                self.bold.insert(index + i, false);
            }
            (
                WidgetEdit::Insert { index, text: text.into(), attributes: Attributes::new() },
                EditSource::User,
            )
        }
    }

    impl Widget for FakeWidget {
        fn selection(&self) -> Selection {
            self.selection
        }

        fn set_selection(&mut self, selection: Selection) {
            self.selection = selection;
        }

        fn insert_text(&mut self, index: usize, text: &str, attributes: &Attributes) {
            for (i, c) in text.chars().enumerate() {
                self.text.insert(index + i, c);
                self.bold.insert(index + i, attributes.contains_key("bold"));
            }
            self.emitted.push((
                WidgetEdit::Insert { index, text: text.into(), attributes: attributes.clone() },
                EditSource::Api,
            ));
        }

        fn delete_text(&mut self, range: Range<usize>) {
            self.text.drain(range.clone());
            self.bold.drain(range.clone());
            self.emitted.push((WidgetEdit::Delete { range }, EditSource::Api));
        }

        fn format_text(&mut self, range: Range<usize>, attributes: &Attributes) {
            if let Some(value) = attributes.get("bold") {
                for b in &mut self.bold[range.clone()] {
                    *b = !value.is_null();
                }
            }
            self.emitted.push((WidgetEdit::Format { range, attributes: attributes.clone() }, EditSource::Api));
        }

        fn set_remote_cursors(&mut self, cursors: &[RemoteCursor]) {
            self.cursors = cursors.to_vec();
        }
    }

    struct Editor {
        session: Session<LocalTransport>,
        inbox: mpsc::UnboundedReceiver<TransportEvent>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        binding: EditorBinding<FakeWidget>,
    }

    impl Editor {
        fn join(hub: &LocalHub, n: u128) -> Self {
            let config = SessionConfig {
                peer: Uuid::from_u128(n),
                ..SessionConfig::new("doc")
            };
            let (transport, inbox) = hub.join("doc", config.peer);
            let mut session = Session::new(config, transport);
            let events = session.subscribe();
            session.connect().unwrap();
            Self {
                session,
                inbox,
                events,
                binding: EditorBinding::new(FakeWidget::default()),
            }
        }

        /// Process transport traffic and mirror resulting events; returns
        /// whether anything happened.
        fn step(&mut self) -> bool {
            let mut busy = false;
            while let Ok(event) = self.inbox.try_recv() {
                self.session.handle_transport_event(event);
                busy = true;
            }
            while let Ok(event) = self.events.try_recv() {
                self.binding.on_session_event(&self.session, &event);
                busy = true;
            }
            // Feed back whatever the widget reported, as a UI loop would.
            let emitted = std::mem::take(&mut self.binding.widget_mut().emitted);
            for (edit, source) in emitted {
                self.binding.on_widget_edit(&mut self.session, edit, source).unwrap();
            }
            busy
        }

        fn type_text(&mut self, index: usize, text: &str) {
            let (edit, source) = self.binding.widget_mut().type_text(index, text);
            self.binding.on_widget_edit(&mut self.session, edit, source).unwrap();
        }
    }

    fn settle(editors: &mut [&mut Editor]) {
        loop {
            let mut busy = false;
            for editor in editors.iter_mut() {
                busy |= editor.step();
            }
            if !busy {
                break;
            }
        }
    }

    #[test]
    fn test_remote_edits_reach_widget_once() {
        let hub = LocalHub::new();
        let mut a = Editor::join(&hub, 1);
        let mut b = Editor::join(&hub, 2);
        settle(&mut [&mut a, &mut b]);

        a.type_text(0, "hello");
        settle(&mut [&mut a, &mut b]);

        assert_eq!(b.binding.widget().text(), "hello");
        assert_eq!(a.binding.widget().text(), "hello");
        // Echoes were suppressed, so nothing was duplicated.
        assert_eq!(a.session.text(), "hello");
        assert_eq!(b.session.text(), "hello");
    }

    #[test]
    fn test_concurrent_typing_keeps_widgets_mirrored() {
        let hub = LocalHub::new();
        let mut a = Editor::join(&hub, 1);
        let mut b = Editor::join(&hub, 2);
        settle(&mut [&mut a, &mut b]);

        a.type_text(0, "Hello");
        b.type_text(0, "Hi ");
        settle(&mut [&mut a, &mut b]);

        assert_eq!(a.session.text(), b.session.text());
        assert_eq!(a.binding.widget().text(), a.session.text());
        assert_eq!(b.binding.widget().text(), b.session.text());
    }

    #[test]
    fn test_remote_format_applied() {
        let hub = LocalHub::new();
        let mut a = Editor::join(&hub, 1);
        let mut b = Editor::join(&hub, 2);
        settle(&mut [&mut a, &mut b]);

        a.type_text(0, "abc");
        settle(&mut [&mut a, &mut b]);
        a.binding
            .on_widget_edit(
                &mut a.session,
                WidgetEdit::Format { range: 0..2, attributes: attributes([("bold", true)]) },
                EditSource::User,
            )
            .unwrap();
        settle(&mut [&mut a, &mut b]);

        assert_eq!(b.binding.widget().bold, vec![true, true, false]);
    }

    #[test]
    fn test_local_selection_shifts_with_remote_insert() {
        let hub = LocalHub::new();
        let mut a = Editor::join(&hub, 1);
        let mut b = Editor::join(&hub, 2);
        settle(&mut [&mut a, &mut b]);
        a.type_text(0, "world");
        settle(&mut [&mut a, &mut b]);

        b.binding.widget_mut().set_selection(Selection::caret(5));
        a.type_text(0, "hello ");
        settle(&mut [&mut a, &mut b]);
        assert_eq!(b.binding.widget().selection(), Selection::caret(11));
    }

    #[test]
    fn test_remote_cursor_and_presence_list() {
        let hub = LocalHub::new();
        let mut a = Editor::join(&hub, 1);
        let mut b = Editor::join(&hub, 2);
        settle(&mut [&mut a, &mut b]);

        a.session.set_presence(Some(Presence::new("Ann", "#123456"))).unwrap();
        b.session.set_presence(Some(Presence::new("Bob", "#654321"))).unwrap();
        a.type_text(0, "abcdef");
        a.binding
            .on_widget_edit(&mut a.session, WidgetEdit::Selection(Selection { anchor: 1, head: 3 }), EditSource::User)
            .unwrap();
        settle(&mut [&mut a, &mut b]);

        let cursors = &b.binding.widget().cursors;
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].name, "Ann");
        assert_eq!(cursors[0].selection, Selection { anchor: 1, head: 3 });

        // The cursor follows its characters when text lands before it.
        b.type_text(0, "__");
        settle(&mut [&mut a, &mut b]);
        assert_eq!(remote_cursors(&b.session)[0].selection, Selection { anchor: 3, head: 5 });

        assert_eq!(presence_list(&b.session), vec![("Ann".to_string(), "#123456".to_string())]);
        assert_eq!(presence_list(&a.session), vec![("Bob".to_string(), "#654321".to_string())]);
    }

    #[test]
    fn test_api_edits_are_not_forwarded() {
        let hub = LocalHub::new();
        let mut a = Editor::join(&hub, 1);
        a.binding
            .on_widget_edit(
                &mut a.session,
                WidgetEdit::Insert { index: 0, text: "x".into(), attributes: Attributes::new() },
                EditSource::Api,
            )
            .unwrap();
        assert!(a.session.text().is_empty());
    }

    #[test]
    fn test_shift_helpers() {
        assert_eq!(shift_for_insert(5, 5, 2), 7);
        assert_eq!(shift_for_insert(5, 6, 2), 5);
        assert_eq!(shift_for_delete(5, 2, 2), 3);
        assert_eq!(shift_for_delete(3, 2, 4), 2);
        assert_eq!(shift_for_delete(1, 2, 4), 1);
    }
}
