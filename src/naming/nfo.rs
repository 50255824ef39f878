//! NFO sidecar writer
//!
//! Produces the prettified `<episodedetails>` XML document media centers
//! read alongside a downloaded file.

use anyhow::Result;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesText, Event};

/// Everything that ends up inside an NFO document
#[derive(Debug, Clone, Default)]
pub struct NfoDetails {
    pub title: String,
    /// The source display name
    pub showtitle: String,
    /// Upload year, or 1 for playlists
    pub season: String,
    /// Ordinal of the item within its season
    pub episode: String,
    pub rating: Option<f64>,
    pub votes: i64,
    pub plot: String,
    /// Thumbnail filename when thumbnails are copied next to the video
    pub thumb: Option<String>,
    /// Age limit; omitted when zero
    pub age_limit: i64,
    pub runtime_secs: i64,
    pub remote_key: String,
    pub site: String,
    pub uploader: String,
    /// Upload date as YYYY-MM-DD
    pub aired: String,
    /// Local creation time as YYYY-MM-DD HH:MM:SS
    pub dateadded: String,
    pub genres: Vec<String>,
}

fn write_text_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: &str,
) -> std::io::Result<()> {
    writer
        .create_element(name)
        .write_text_content(BytesText::new(text))?;
    Ok(())
}

/// Render the NFO XML, one element per line, two-space indented
pub fn render_nfo(details: &NfoDetails) -> Result<String> {
    let mut buf = Vec::new();
    let mut writer = Writer::new_with_indent(&mut buf, b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;

    let episodedetails = writer.create_element("episodedetails");
    episodedetails.write_inner_content(|writer| {
        write_text_element(writer, "title", &details.title)?;
        write_text_element(writer, "showtitle", &details.showtitle)?;
        write_text_element(writer, "season", &details.season)?;
        write_text_element(writer, "episode", &details.episode)?;

        let ratings = writer.create_element("ratings");
        if let Some(rating) = details.rating {
            ratings.write_inner_content(|writer| {
                writer
                    .create_element("rating")
                    .with_attribute(("name", details.site.to_lowercase().as_str()))
                    .with_attribute(("max", "5"))
                    .with_attribute(("default", "true"))
                    .write_inner_content(|writer| {
                        write_text_element(writer, "value", &rating.to_string())?;
                        write_text_element(writer, "votes", &details.votes.to_string())?;
                        Ok(())
                    })?;
                Ok(())
            })?;
        } else {
            ratings.write_empty()?;
        }

        write_text_element(writer, "plot", &details.plot)?;
        write_text_element(writer, "thumb", details.thumb.as_deref().unwrap_or(""))?;
        if details.age_limit > 0 {
            write_text_element(writer, "mpaa", &details.age_limit.to_string())?;
        }
        write_text_element(writer, "runtime", &details.runtime_secs.to_string())?;
        write_text_element(writer, "id", details.remote_key.trim())?;
        writer
            .create_element("uniqueid")
            .with_attribute(("type", details.site.to_lowercase().as_str()))
            .with_attribute(("default", "True"))
            .write_text_content(BytesText::new(details.remote_key.trim()))?;
        write_text_element(writer, "studio", details.uploader.trim())?;
        write_text_element(writer, "aired", &details.aired)?;
        write_text_element(writer, "dateadded", &details.dateadded)?;
        for genre in &details.genres {
            write_text_element(writer, "genre", genre.trim())?;
        }
        Ok(())
    })?;

    let mut xml = String::from_utf8(buf)?;
    xml.push('\n');
    Ok(xml)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_details() -> NfoDetails {
        NfoDetails {
            title: "An Example Title".into(),
            showtitle: "Some Channel".into(),
            season: "2017".into(),
            episode: "3".into(),
            rating: Some(4.5),
            votes: 123,
            plot: "A description.".into(),
            thumb: Some("foo.jpg".into()),
            age_limit: 0,
            runtime_secs: 600,
            remote_key: "abc".into(),
            site: "Youtube".into(),
            uploader: "Some Channel Name".into(),
            aired: "2017-09-11".into(),
            dateadded: "2020-01-01 10:30:00".into(),
            genres: vec!["Music".into(), "Comedy".into()],
        }
    }

    #[test]
    fn test_render_nfo_structure() {
        let xml = render_nfo(&sample_details()).unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
        assert!(xml.contains("<episodedetails>"));
        assert!(xml.contains("<title>An Example Title</title>"));
        assert!(xml.contains("<showtitle>Some Channel</showtitle>"));
        assert!(xml.contains("<season>2017</season>"));
        assert!(xml.contains("<episode>3</episode>"));
        assert!(xml.contains("<rating name=\"youtube\" max=\"5\" default=\"true\">"));
        assert!(xml.contains("<value>4.5</value>"));
        assert!(xml.contains("<votes>123</votes>"));
        assert!(xml.contains("<thumb>foo.jpg</thumb>"));
        assert!(xml.contains("<uniqueid type=\"youtube\" default=\"True\">abc</uniqueid>"));
        assert!(xml.contains("<genre>Music</genre>"));
        assert!(xml.contains("<genre>Comedy</genre>"));
        // age limit of zero is omitted entirely
        assert!(!xml.contains("<mpaa>"));
    }

    #[test]
    fn test_render_nfo_escapes_text() {
        let mut details = sample_details();
        details.title = "Tom & Jerry <3".into();
        let xml = render_nfo(&details).unwrap();
        assert!(xml.contains("<title>Tom &amp; Jerry &lt;3</title>"));
    }

    #[test]
    fn test_render_nfo_without_rating() {
        let mut details = sample_details();
        details.rating = None;
        let xml = render_nfo(&details).unwrap();
        assert!(xml.contains("<ratings/>"));
        assert!(!xml.contains("<value>"));
    }
}
