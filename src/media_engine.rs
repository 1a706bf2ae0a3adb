use webrtc::{
    api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8},
    error::Result,
    rtp_transceiver::{
        rtp_codec::{
            RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability,
            RTPCodecType,
        },
        RTCPFeedback,
    },
    sdp::extmap,
};

/// Opus and VP8 with RTX, the codecs [`crate::media::LocalMediaSource`] produces.
pub fn register_mesh_codecs(me: &mut MediaEngine) -> Result<()> {
    let audio_codecs = vec![RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        payload_type: 111,
        ..Default::default()
    }];

    let video_rtcp_feedback = vec![
        RTCPFeedback {
            typ: "goog-remb".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "ccm".to_owned(),
            parameter: "fir".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "pli".to_owned(),
        },
    ];
    let video_codecs = vec![
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_owned(),
                rtcp_feedback: video_rtcp_feedback,
            },
            payload_type: 96,
            ..Default::default()
        },
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: "video/rtx".to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "apt=96".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 97,
            ..Default::default()
        },
    ];

    for codec in audio_codecs {
        me.register_codec(codec, RTPCodecType::Audio)?;
    }

    for codec in video_codecs {
        me.register_codec(codec, RTPCodecType::Video)?;
    }

    Ok(())
}

/// The audio level extension is what remote speaking detection reads, so it must be negotiated.
pub fn register_mesh_extensions(media_engine: &mut MediaEngine) -> Result<()> {
    let extension_video = vec![extmap::SDES_MID_URI, extmap::ABS_SEND_TIME_URI];

    for extension in extension_video {
        media_engine.register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: extension.to_owned(),
            },
            RTPCodecType::Video,
            None,
        )?;
    }

    let extension_audio = vec![extmap::SDES_MID_URI, extmap::AUDIO_LEVEL_URI];

    for extension in extension_audio {
        media_engine.register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: extension.to_owned(),
            },
            RTPCodecType::Audio,
            None,
        )?;
    }
    Ok(())
}
