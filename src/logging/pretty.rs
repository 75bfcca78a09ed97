//! Colorful console format for local development.

use nu_ansi_term::{Color, Style};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;

pub struct PrettyLogFormat;

fn styled(
    writer: &mut Writer<'_>,
    style: Style,
    write: impl FnOnce(&mut Writer<'_>) -> std::fmt::Result,
) -> std::fmt::Result {
    write!(writer, "{}", style.prefix())?;
    write(writer)?;
    write!(writer, "{}", style.suffix())
}

fn level_style(level: &Level) -> Style {
    match *level {
        Level::TRACE => Style::new().fg(Color::Purple),
        Level::DEBUG => Style::new().fg(Color::Blue),
        Level::INFO => Style::new().fg(Color::Green),
        Level::WARN => Style::new().fg(Color::Yellow),
        Level::ERROR => Style::new().fg(Color::Red),
    }
}

impl<S, N> FormatEvent<S, N> for PrettyLogFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();

        styled(&mut writer, Style::new().dimmed(), |w| {
            write!(w, "{} ", chrono::Local::now().format("%T%.3f"))
        })?;
        styled(&mut writer, level_style(metadata.level()), |w| {
            write!(w, "{:<5}", metadata.level())
        })?;

        let depth = ctx.event_scope().map(|scope| scope.count()).unwrap_or(0);
        if depth > 0 {
            styled(&mut writer, Style::new().fg(Color::Magenta), |w| {
                write!(w, " {}", "|".repeat(depth))
            })?;
        }
        write!(writer, " ")?;

        let mut message = String::new();
        ctx.field_format()
            .format_fields(Writer::new(&mut message), event)?;

        // Span creation events carry the message "new"; show the span instead.
        let entered = if metadata.is_span() && message == "new" {
            ctx.event_scope().and_then(|mut scope| scope.next())
        } else {
            None
        };

        styled(&mut writer, Style::new().dimmed(), |w| {
            write!(w, "{}: ", metadata.target())
        })?;
        match entered {
            Some(span) => {
                styled(&mut writer, Style::new().fg(Color::Magenta), |w| {
                    write!(w, "=> ")
                })?;
                write!(writer, "{}", span.name())?;
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>()
                    && !fields.is_empty()
                {
                    write!(writer, "{{{}}}", fields)?;
                }
            }
            None => write!(writer, "{}", message)?,
        }

        writeln!(writer)
    }
}
